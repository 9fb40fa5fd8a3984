//! Extension-based routing table.
//!
//! The table is built once at startup and is the only place that decides who
//! owns a file type. Store, fetch, delete, archive and list all go through
//! [`RoutingTable::classify`], so the operations cannot disagree.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, ensure};

use crate::path::VirtualPath;

/// A remote storage node and the single extension it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: u32,
    pub extension: String,
    pub addr: String,
}

impl NodeSpec {
    /// Namespace marker the node expects on every path it receives.
    pub fn marker(&self) -> String {
        format!("~S{}", self.id)
    }
}

impl FromStr for NodeSpec {
    type Err = anyhow::Error;

    /// Parses `<id>=<extension>@<addr>`, e.g. `2=.pdf@127.0.0.1:7100`.
    fn from_str(raw: &str) -> Result<Self> {
        let (id, target) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("node '{raw}' must look like <id>=<ext>@<addr>"))?;
        let (extension, addr) = target
            .split_once('@')
            .ok_or_else(|| anyhow!("node '{raw}' is missing @<addr>"))?;

        let id = id
            .trim()
            .parse()
            .with_context(|| format!("node id in '{raw}' is not a number"))?;
        let addr = addr.trim();
        ensure!(!addr.is_empty(), "node '{raw}' has an empty address");

        Ok(Self {
            id,
            extension: normalize_extension(extension)?,
            addr: addr.to_string(),
        })
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}@{}", self.id, self.extension, self.addr)
    }
}

/// Where a request for a given file type has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingTarget<'a> {
    Local,
    Remote(&'a NodeSpec),
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    marker: String,
    extension: String,
    remotes: BTreeMap<String, NodeSpec>,
}

impl RoutingTable {
    pub fn new(marker: &str, extension: &str, nodes: Vec<NodeSpec>) -> Result<Self> {
        ensure!(
            marker.starts_with('~') && marker.len() > 1 && !marker.contains('/'),
            "marker '{marker}' must look like ~NAME"
        );
        let extension = normalize_extension(extension)?;

        let mut remotes = BTreeMap::new();
        let mut seen_ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            ensure!(
                node.extension != extension,
                "extension {} is already handled locally",
                node.extension
            );
            ensure!(
                node.marker() != marker,
                "node {} would share the front-end marker {marker}",
                node.id
            );
            ensure!(!seen_ids.contains(&node.id), "node id {} is listed twice", node.id);
            seen_ids.push(node.id);

            if let Some(previous) = remotes.insert(node.extension.clone(), node) {
                return Err(anyhow!(
                    "extension {} is routed to more than one node",
                    previous.extension
                ));
            }
        }

        Ok(Self {
            marker: marker.to_string(),
            extension,
            remotes,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn local_extension(&self) -> &str {
        &self.extension
    }

    pub fn classify(&self, path: &VirtualPath) -> RoutingTarget<'_> {
        self.classify_extension(path.extension())
    }

    /// Missing extensions are unsupported: no node owns them.
    pub fn classify_extension(&self, extension: Option<&str>) -> RoutingTarget<'_> {
        match extension {
            Some(ext) if ext == self.extension => RoutingTarget::Local,
            Some(ext) => self
                .remotes
                .get(ext)
                .map_or(RoutingTarget::Unsupported, RoutingTarget::Remote),
            None => RoutingTarget::Unsupported,
        }
    }

    /// Swaps the front-end marker for the node's, remainder untouched.
    pub fn rewrite_for_node(&self, path: &VirtualPath, node: &NodeSpec) -> VirtualPath {
        path.with_marker(&node.marker())
    }

    /// Remote nodes in ascending id order.
    pub fn nodes(&self) -> Vec<&NodeSpec> {
        let mut nodes: Vec<&NodeSpec> = self.remotes.values().collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }
}

/// Accepts `pdf` or `.pdf` and returns `.pdf`.
pub fn normalize_extension(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_start_matches('.');
    ensure!(
        !trimmed.is_empty() && !trimmed.contains(&['.', '/', ' '][..]),
        "'{raw}' is not a file extension"
    );
    Ok(format!(".{trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_table() -> RoutingTable {
        RoutingTable::new(
            "~front",
            ".c",
            vec![
                "4=.zip@127.0.0.1:7300".parse().unwrap(),
                "2=.pdf@127.0.0.1:7100".parse().unwrap(),
                "3=txt@127.0.0.1:7200".parse().unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn parses_node_specs() {
        let node: NodeSpec = "2=pdf@localhost:7100".parse().unwrap();
        assert_eq!(node.id, 2);
        assert_eq!(node.extension, ".pdf");
        assert_eq!(node.addr, "localhost:7100");
        assert_eq!(node.marker(), "~S2");
        assert_eq!(node.to_string(), "2=.pdf@localhost:7100");

        assert!("pdf@localhost:7100".parse::<NodeSpec>().is_err());
        assert!("x=.pdf@localhost:7100".parse::<NodeSpec>().is_err());
        assert!("2=.pdf".parse::<NodeSpec>().is_err());
        assert!("2=.pdf@".parse::<NodeSpec>().is_err());
    }

    #[test]
    fn classifies_by_extension() {
        let table = demo_table();
        let local = VirtualPath::parse("~front/src/main.c").unwrap();
        let remote = VirtualPath::parse("~front/docs/report.pdf").unwrap();
        let unknown = VirtualPath::parse("~front/docs/photo.png").unwrap();
        let bare = VirtualPath::parse("~front/docs/README").unwrap();

        assert_eq!(table.classify(&local), RoutingTarget::Local);
        assert!(matches!(table.classify(&remote), RoutingTarget::Remote(node) if node.id == 2));
        assert_eq!(table.classify(&unknown), RoutingTarget::Unsupported);
        assert_eq!(table.classify(&bare), RoutingTarget::Unsupported);
    }

    #[test]
    fn rewrite_targets_the_owning_node_for_every_extension() {
        let table = demo_table();
        for node in table.nodes() {
            let path = VirtualPath::parse(&format!("~front/a/b/file{}", node.extension)).unwrap();
            let RoutingTarget::Remote(owner) = table.classify(&path) else {
                panic!("{} should be remote", node.extension);
            };
            let rewritten = table.rewrite_for_node(&path, owner);
            assert_eq!(rewritten.marker(), owner.marker());
            assert_eq!(rewritten.remainder(), path.remainder());
        }
    }

    #[test]
    fn nodes_are_listed_in_id_order() {
        let ids: Vec<u32> = demo_table().nodes().iter().map(|node| node.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn rejects_conflicting_tables() {
        let pdf: NodeSpec = "2=.pdf@127.0.0.1:7100".parse().unwrap();
        let pdf_again: NodeSpec = "3=.pdf@127.0.0.1:7200".parse().unwrap();
        let same_id: NodeSpec = "2=.txt@127.0.0.1:7200".parse().unwrap();
        let local_ext: NodeSpec = "3=.c@127.0.0.1:7200".parse().unwrap();

        assert!(RoutingTable::new("~S1", ".c", vec![pdf.clone(), pdf_again]).is_err());
        assert!(RoutingTable::new("~S1", ".c", vec![pdf.clone(), same_id]).is_err());
        assert!(RoutingTable::new("~S1", ".c", vec![local_ext]).is_err());
        assert!(RoutingTable::new("~S2", ".c", vec![pdf.clone()]).is_err());
        assert!(RoutingTable::new("S1", ".c", vec![pdf]).is_err());
    }

    #[test]
    fn normalizes_extensions() {
        assert_eq!(normalize_extension("pdf").unwrap(), ".pdf");
        assert_eq!(normalize_extension(" .zip ").unwrap(), ".zip");
        assert!(normalize_extension(".").is_err());
        assert!(normalize_extension("tar.gz").is_err());
    }
}
