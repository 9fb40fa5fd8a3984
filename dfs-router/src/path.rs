//! Virtual paths: `~<marker>/<relative path>` names inside the distributed
//! namespace.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{DfsError, Result};

const MARKER_PREFIX: char = '~';

/// A namespace marker plus the remainder of the path.
///
/// The remainder keeps its leading `/` (or is empty for the namespace root)
/// so rewriting the marker never touches it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    marker: String,
    rest: String,
}

impl VirtualPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !raw.starts_with(MARKER_PREFIX) {
            return Err(DfsError::InvalidCommand(format!(
                "path '{raw}' must start with a ~marker"
            )));
        }

        let (marker, rest) = match raw.find('/') {
            Some(idx) => raw.split_at(idx),
            None => (raw, ""),
        };
        if marker.len() == MARKER_PREFIX.len_utf8() {
            return Err(DfsError::InvalidCommand(format!(
                "path '{raw}' has an empty marker"
            )));
        }

        Ok(Self {
            marker: marker.to_string(),
            rest: rest.trim_end_matches('/').to_string(),
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn remainder(&self) -> &str {
        &self.rest
    }

    pub fn is_rooted_at(&self, marker: &str) -> bool {
        self.marker == marker
    }

    /// Final path component, if the path names anything below the root.
    pub fn file_name(&self) -> Option<&str> {
        self.rest.rsplit('/').next().filter(|name| !name.is_empty())
    }

    /// Suffix of the final component starting at its last `.`, e.g. `.pdf`.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name()?;
        let idx = name.rfind('.')?;
        let ext = &name[idx..];
        (ext.len() > 1).then_some(ext)
    }

    /// Appends a file name taken from a client-side path; only its last
    /// component is kept.
    pub fn join_file(&self, filename: &str) -> Result<Self> {
        let name = Path::new(filename)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DfsError::InvalidCommand(format!("invalid file name '{filename}'")))?;

        Ok(Self {
            marker: self.marker.clone(),
            rest: format!("{}/{}", self.rest, name),
        })
    }

    /// Same remainder under a different namespace marker.
    pub fn with_marker(&self, marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
            rest: self.rest.clone(),
        }
    }

    /// Maps the path under `root/<marker without ~>`, refusing anything that
    /// is not a plain relative component.
    pub fn to_local(&self, root: &Path) -> Result<PathBuf> {
        let mut local = root.join(marker_dir(&self.marker));
        for component in Path::new(self.rest.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => local.push(part),
                Component::CurDir => {}
                _ => return Err(DfsError::PathEscape(self.to_string())),
            }
        }
        Ok(local)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.marker, self.rest)
    }
}

/// Directory name a marker occupies under a storage root (`~S1` → `S1`).
pub fn marker_dir(marker: &str) -> &str {
    marker.trim_start_matches(MARKER_PREFIX)
}
