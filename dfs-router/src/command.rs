//! Command-line parsing for both sides of the protocol.
//!
//! Clients talk to the front-end with [`Command`]; the front-end talks to
//! storage nodes with [`NodeCommand`]. Both use the same verbs. The only shape
//! difference is `uploadf`: a client names a file and a destination
//! directory, while a node receives the full destination path.

use std::fmt;

use crate::error::{DfsError, Result};
use crate::path::VirtualPath;
use crate::routing::normalize_extension;

pub const UPLOAD: &str = "uploadf";
pub const DOWNLOAD: &str = "downlf";
pub const REMOVE: &str = "removef";
pub const ARCHIVE: &str = "downltar";
pub const LIST: &str = "dispfnames";

/// A request from a client to the front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Store {
        filename: String,
        destination: VirtualPath,
    },
    Fetch {
        path: VirtualPath,
    },
    Delete {
        path: VirtualPath,
    },
    ArchiveByType {
        extension: String,
    },
    ListNames {
        directory: VirtualPath,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = parts.split_first() else {
            return Err(DfsError::InvalidCommand("empty command".to_string()));
        };

        match (*verb, args) {
            (UPLOAD, [filename, destination]) => Ok(Command::Store {
                filename: filename.to_string(),
                destination: VirtualPath::parse(destination)?,
            }),
            (DOWNLOAD, [path]) => Ok(Command::Fetch {
                path: VirtualPath::parse(path)?,
            }),
            (REMOVE, [path]) => Ok(Command::Delete {
                path: VirtualPath::parse(path)?,
            }),
            (ARCHIVE, [tag]) => Ok(Command::ArchiveByType {
                extension: parse_type_tag(tag)?,
            }),
            (LIST, [directory]) => Ok(Command::ListNames {
                directory: VirtualPath::parse(directory)?,
            }),
            _ => Err(DfsError::InvalidCommand(line.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Store { .. } => UPLOAD,
            Command::Fetch { .. } => DOWNLOAD,
            Command::Delete { .. } => REMOVE,
            Command::ArchiveByType { .. } => ARCHIVE,
            Command::ListNames { .. } => LIST,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Store {
                filename,
                destination,
            } => write!(f, "{UPLOAD} {filename} {destination}"),
            Command::Fetch { path } => write!(f, "{DOWNLOAD} {path}"),
            Command::Delete { path } => write!(f, "{REMOVE} {path}"),
            Command::ArchiveByType { extension } => write!(f, "{ARCHIVE} {extension}"),
            Command::ListNames { directory } => write!(f, "{LIST} {directory}"),
        }
    }
}

/// A request from the front-end to a storage node, with paths already
/// rewritten into the node's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Store { path: VirtualPath },
    Fetch { path: VirtualPath },
    Delete { path: VirtualPath },
    Archive { extension: String },
    List { directory: VirtualPath },
}

impl NodeCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [UPLOAD, path] => Ok(NodeCommand::Store {
                path: VirtualPath::parse(path)?,
            }),
            [DOWNLOAD, path] => Ok(NodeCommand::Fetch {
                path: VirtualPath::parse(path)?,
            }),
            [REMOVE, path] => Ok(NodeCommand::Delete {
                path: VirtualPath::parse(path)?,
            }),
            [ARCHIVE, tag] => Ok(NodeCommand::Archive {
                extension: parse_type_tag(tag)?,
            }),
            [LIST, directory] => Ok(NodeCommand::List {
                directory: VirtualPath::parse(directory)?,
            }),
            _ => Err(DfsError::InvalidCommand(line.to_string())),
        }
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCommand::Store { path } => write!(f, "{UPLOAD} {path}"),
            NodeCommand::Fetch { path } => write!(f, "{DOWNLOAD} {path}"),
            NodeCommand::Delete { path } => write!(f, "{REMOVE} {path}"),
            NodeCommand::Archive { extension } => write!(f, "{ARCHIVE} {extension}"),
            NodeCommand::List { directory } => write!(f, "{LIST} {directory}"),
        }
    }
}

fn parse_type_tag(tag: &str) -> Result<String> {
    normalize_extension(tag).map_err(|_| DfsError::UnsupportedType(tag.to_string()))
}
