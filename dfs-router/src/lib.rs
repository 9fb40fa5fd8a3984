//! Extension-routed distributed file store.
//!
//! Clients talk to a single front-end using five text commands. The front-end
//! keeps one file type itself and transparently forwards every other supported
//! type to the storage node that owns it, rewriting the namespace marker on the
//! way. Each module covers one concern:
//!
//! - [`channel`] frames command lines, size headers and payloads on the wire.
//! - [`path`] parses `~marker/rest` virtual paths and maps them to disk.
//! - [`routing`] holds the extension-to-node table every operation consults.
//! - [`command`] parses client commands and the node-facing sub-protocol.
//! - [`store`] persists, lists and archives local files and stages payloads
//!   in flight.
//! - [`node_client`] relays one command to a storage node with a timeout.
//! - [`listing`] merges local and remote listings in a fixed order.
//! - [`dispatcher`] runs the front-end's per-connection command loop.
//! - [`storage_node`] serves the node side of the protocol.
//! - [`server`] accepts connections for either role until shutdown.
//! - [`cli`] and [`config`] turn command-line flags into validated settings.
//!
//! Integration tests under `tests/` run real front-ends and nodes on ephemeral
//! ports.

pub mod channel;
pub mod cli;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod listing;
pub mod node_client;
pub mod path;
pub mod routing;
pub mod server;
pub mod storage_node;
pub mod store;
