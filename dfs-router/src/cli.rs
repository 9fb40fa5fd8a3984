use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};

use crate::routing::NodeSpec;

#[derive(Parser, Debug)]
#[command(author, version, about = "Extension-routed distributed file store", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the front-end that clients connect to.
    FrontEnd(FrontEndArgs),
    /// Run a storage node that owns a single file type.
    Node(NodeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct FrontEndArgs {
    /// Socket address to accept clients on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7010")]
    pub listen: SocketAddr,

    /// Directory holding locally stored files.
    #[arg(long, default_value = "dfs-data/front-end", value_hint = ValueHint::DirPath)]
    pub root: PathBuf,

    /// Namespace marker clients use in every path.
    #[arg(long, default_value = "~S1")]
    pub marker: String,

    /// File type stored locally instead of on a node.
    #[arg(long, default_value = ".c")]
    pub extension: String,

    /// Comma-separated storage nodes: id=ext@addr,id=ext@addr,...
    #[arg(
        long = "node",
        value_delimiter = ',',
        default_value = "2=.pdf@127.0.0.1:7100,3=.txt@127.0.0.1:7200,4=.zip@127.0.0.1:7300"
    )]
    pub nodes: Vec<NodeSpec>,

    /// Upper bound for upload, download and delete relays.
    #[arg(long, default_value_t = 30)]
    pub relay_timeout_secs: u64,

    /// Upper bound for archive relays.
    #[arg(long, default_value_t = 10)]
    pub archive_timeout_secs: u64,

    /// Upper bound for each node's share of a listing.
    #[arg(long, default_value_t = 2)]
    pub list_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Socket address to accept front-end connections on.
    #[arg(long, default_value = "127.0.0.1:7100")]
    pub listen: SocketAddr,

    /// Directory holding this node's files.
    #[arg(long, default_value = "dfs-data/node", value_hint = ValueHint::DirPath)]
    pub root: PathBuf,

    /// Namespace marker every request path must carry, e.g. ~S2.
    #[arg(long, default_value = "~S2")]
    pub marker: String,

    /// The only file type this node stores.
    #[arg(long, default_value = ".pdf")]
    pub extension: String,
}
