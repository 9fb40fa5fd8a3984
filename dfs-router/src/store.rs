//! Local file storage for the one extension a process owns, plus the staging
//! area that holds in-flight payloads.
//!
//! Files live under `<root>/<marker without ~>/...`. Payloads are always
//! received into a staging file first and only moved into place once complete,
//! so a truncated upload never leaves a partial file behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nanoid::nanoid;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::debug;
use walkdir::WalkDir;

use crate::channel;
use crate::error::{DfsError, Result};
use crate::path::{VirtualPath, marker_dir};

const STAGING_DIR: &str = ".staging";

/// A complete payload sitting in the staging area. The file is removed when
/// the value is dropped unless it was persisted.
#[derive(Debug)]
pub struct StagedPayload {
    path: TempPath,
    len: u64,
}

impl StagedPayload {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn open(&self) -> io::Result<File> {
        File::open(&*self.path).await
    }

    /// Moves the payload to `dest`, replacing any previous file.
    pub async fn persist(self, dest: &Path) -> io::Result<()> {
        let staged = self.path.keep().map_err(io::Error::from)?;
        if let Err(err) = tokio::fs::rename(&staged, dest).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(err);
        }
        Ok(())
    }
}

/// Scratch directory for payloads in flight. Each staged file is named after a
/// fresh operation id so concurrent uploads of the same name never collide.
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn under_root(root: &Path) -> Self {
        Self::new(root.join(STAGING_DIR))
    }

    /// Creates a uniquely named staging file. Blocks on the filesystem.
    fn create_blocking(&self, suffix: &str) -> io::Result<(fs::File, TempPath)> {
        fs::create_dir_all(&self.dir)?;
        let named = tempfile::Builder::new()
            .prefix(&format!("{}-", nanoid!(10)))
            .suffix(suffix)
            .tempfile_in(&self.dir)?;
        Ok(named.into_parts())
    }

    async fn create(&self, label: &str) -> io::Result<(File, TempPath)> {
        let staging = self.clone();
        let suffix = format!("-{}", sanitize_label(label));
        let (file, path) = tokio::task::spawn_blocking(move || staging.create_blocking(&suffix))
            .await
            .map_err(io::Error::other)??;
        Ok((File::from_std(file), path))
    }

    /// Receives exactly `len` bytes from `reader` into a new staged file.
    ///
    /// If the staging file cannot be created or written, the bytes are still
    /// drained from `reader` and the failure is reported as
    /// [`DfsError::Storage`].
    pub async fn receive<R>(&self, reader: &mut R, len: u64, label: &str) -> Result<StagedPayload>
    where
        R: AsyncRead + Unpin,
    {
        let (mut file, path) = match self.create(label).await {
            Ok(created) => created,
            Err(err) => {
                channel::drain(reader, len).await?;
                return Err(DfsError::Storage(err));
            }
        };

        channel::recv_payload_into(reader, &mut file, len).await?;
        debug!(staged = %path.display(), bytes = len, "payload staged");
        Ok(StagedPayload { path, len })
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

/// Storage for the extension this process owns.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    marker: String,
    extension: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, marker: &str, extension: &str) -> Self {
        Self {
            root: root.into(),
            marker: marker.to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Directory holding every file of this store's type.
    pub fn type_root(&self) -> PathBuf {
        self.root.join(marker_dir(&self.marker))
    }

    pub fn owns(&self, path: &VirtualPath) -> bool {
        path.extension() == Some(self.extension.as_str())
    }

    pub fn resolve(&self, path: &VirtualPath) -> Result<PathBuf> {
        if !path.is_rooted_at(&self.marker) {
            return Err(DfsError::InvalidDestination {
                expected: self.marker.clone(),
            });
        }
        path.to_local(&self.root)
    }

    /// Moves a staged payload to `path`, creating parent directories.
    pub async fn persist(&self, payload: StagedPayload, path: &VirtualPath) -> Result<()> {
        let dest = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DfsError::Storage)?;
        }
        payload.persist(&dest).await.map_err(DfsError::Storage)?;
        debug!(dest = %dest.display(), "file persisted");
        Ok(())
    }

    /// Opens a stored file for streaming. `None` when it does not exist.
    pub async fn open(&self, path: &VirtualPath) -> Result<Option<(File, u64)>> {
        let local = self.resolve(path)?;
        match File::open(&local).await {
            Ok(file) => {
                let metadata = file.metadata().await.map_err(DfsError::Storage)?;
                if !metadata.is_file() {
                    return Ok(None);
                }
                Ok(Some((file, metadata.len())))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DfsError::Storage(err)),
        }
    }

    /// Returns whether a file was removed.
    pub async fn delete(&self, path: &VirtualPath) -> Result<bool> {
        let local = self.resolve(path)?;
        match tokio::fs::remove_file(&local).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(DfsError::Storage(err)),
        }
    }

    /// Sorted names of the regular files of this type directly inside
    /// `directory`. A missing directory lists as empty.
    pub async fn list(&self, directory: &VirtualPath) -> Result<Vec<String>> {
        let local = self.resolve(directory)?;
        let mut entries = match tokio::fs::read_dir(&local).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DfsError::Storage(err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(DfsError::Storage)? {
            let file_type = entry.file_type().await.map_err(DfsError::Storage)?;
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if has_extension(name, &self.extension) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Builds a tar archive of every file of this type under the type root.
    /// `None` when there is nothing to archive.
    pub async fn archive(&self, staging: &Staging) -> Result<Option<StagedPayload>> {
        let type_root = self.type_root();
        let extension = self.extension.clone();
        let staging = staging.clone();

        tokio::task::spawn_blocking(move || build_archive(&type_root, &extension, &staging))
            .await
            .map_err(|err| DfsError::Storage(io::Error::other(err)))?
            .map_err(DfsError::Storage)
    }
}

fn has_extension(name: &str, extension: &str) -> bool {
    name.len() > extension.len() && name.ends_with(extension)
}

fn build_archive(
    type_root: &Path,
    extension: &str,
    staging: &Staging,
) -> io::Result<Option<StagedPayload>> {
    let mut members = Vec::new();
    for entry in WalkDir::new(type_root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let is_match = entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| has_extension(name, extension));
        if is_match {
            members.push(entry.into_path());
        }
    }
    if members.is_empty() {
        return Ok(None);
    }

    let (file, path) = staging.create_blocking(".tar")?;

    let mut builder = tar::Builder::new(file);
    for member in &members {
        let relative = member.strip_prefix(type_root).unwrap_or(member);
        builder.append_path_with_name(member, relative)?;
    }
    let file = builder.into_inner()?;
    let len = file.metadata()?.len();

    Ok(Some(StagedPayload { path, len }))
}
