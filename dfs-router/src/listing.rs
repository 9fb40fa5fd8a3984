//! Merges file names from the local store and every remote node into one
//! ordered listing.
//!
//! Order is "sorted within a group, grouped by origin": local names first, then
//! each remote node in ascending id order. Groups are never interleaved.

use futures::future::join_all;
use tracing::warn;

use crate::error::Result;
use crate::node_client::NodeClient;
use crate::path::VirtualPath;
use crate::routing::RoutingTable;
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrigin {
    Local,
    Node(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingGroup {
    pub origin: ListingOrigin,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedListing {
    groups: Vec<ListingGroup>,
}

impl AggregatedListing {
    /// Appends a group after sorting its names.
    pub fn push(&mut self, origin: ListingOrigin, mut names: Vec<String>) {
        names.sort();
        self.groups.push(ListingGroup { origin, names });
    }

    pub fn groups(&self) -> &[ListingGroup] {
        &self.groups
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|group| group.names.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|group| group.names.is_empty())
    }

    /// One name per line, each line newline-terminated.
    pub fn render(&self) -> String {
        self.names().fold(String::new(), |mut out, name| {
            out.push_str(name);
            out.push('\n');
            out
        })
    }
}

/// Collects the listing for `directory`, which must be rooted at the
/// front-end's marker.
///
/// Nodes are queried concurrently. A node that fails or exceeds its list
/// timeout contributes an empty group; only a local failure is an error.
pub async fn aggregate(
    routes: &RoutingTable,
    store: &LocalStore,
    nodes: &NodeClient,
    directory: &VirtualPath,
) -> Result<AggregatedListing> {
    let local_names = store.list(directory).await?;

    let remote_nodes = routes.nodes();
    let queries = remote_nodes.iter().map(|node| {
        let rewritten = routes.rewrite_for_node(directory, node);
        async move {
            match nodes.relay_list(node, &rewritten).await {
                Ok(names) => names,
                Err(err) => {
                    warn!(node = node.id, dir = %rewritten, error = %err, "node listing unavailable");
                    Vec::new()
                }
            }
        }
    });
    let remote_names = join_all(queries).await;

    let mut listing = AggregatedListing::default();
    listing.push(ListingOrigin::Local, local_names);
    for (node, names) in remote_nodes.iter().zip(remote_names) {
        listing.push(ListingOrigin::Node(node.id), names);
    }
    Ok(listing)
}
