//! Validated runtime configuration built from command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, ensure};

use crate::cli::{FrontEndArgs, NodeArgs};
use crate::node_client::RelayTimeouts;
use crate::routing::{RoutingTable, normalize_extension};

#[derive(Debug, Clone)]
pub struct FrontEndConfig {
    pub listen: SocketAddr,
    pub root: PathBuf,
    pub routes: RoutingTable,
    pub timeouts: RelayTimeouts,
}

impl TryFrom<FrontEndArgs> for FrontEndConfig {
    type Error = anyhow::Error;

    fn try_from(args: FrontEndArgs) -> Result<Self> {
        let routes = RoutingTable::new(&args.marker, &args.extension, args.nodes)
            .context("invalid routing table")?;
        let timeouts = RelayTimeouts {
            transfer: positive_secs(args.relay_timeout_secs, "relay timeout")?,
            archive: positive_secs(args.archive_timeout_secs, "archive timeout")?,
            list: positive_secs(args.list_timeout_secs, "list timeout")?,
        };
        Ok(Self {
            listen: args.listen,
            root: args.root,
            routes,
            timeouts,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StorageNodeConfig {
    pub listen: SocketAddr,
    pub root: PathBuf,
    pub marker: String,
    pub extension: String,
}

impl TryFrom<NodeArgs> for StorageNodeConfig {
    type Error = anyhow::Error;

    fn try_from(args: NodeArgs) -> Result<Self> {
        ensure!(
            args.marker.starts_with('~') && args.marker.len() > 1 && !args.marker.contains('/'),
            "marker '{}' must look like ~NAME",
            args.marker
        );
        Ok(Self {
            listen: args.listen,
            root: args.root,
            marker: args.marker,
            extension: normalize_extension(&args.extension)?,
        })
    }
}

fn positive_secs(secs: u64, what: &str) -> Result<Duration> {
    ensure!(secs > 0, "{what} must be at least one second");
    Ok(Duration::from_secs(secs))
}
