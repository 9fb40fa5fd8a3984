use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use dfs_router::{
    cli::{Cli, Mode},
    config::{FrontEndConfig, StorageNodeConfig},
    server::{FrontEnd, StorageNode},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.mode {
        Mode::FrontEnd(args) => {
            let config = FrontEndConfig::try_from(args)?;
            let listener = TcpListener::bind(config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            for node in config.routes.nodes() {
                info!(node = node.id, extension = %node.extension, addr = %node.addr, "routing");
            }
            let front_end = FrontEnd::new(listener, config);
            let addr = front_end.local_addr()?;
            info!("front-end listening on {}", addr);
            if let Err(err) = front_end.run_until_ctrl_c().await {
                warn!("front-end exited with error: {err:?}");
                return Err(err);
            }
        }
        Mode::Node(args) => {
            let config = StorageNodeConfig::try_from(args)?;
            let listener = TcpListener::bind(config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            let node = StorageNode::new(listener, config);
            let addr = node.local_addr()?;
            info!("storage node listening on {}", addr);
            if let Err(err) = node.run_until_ctrl_c().await {
                warn!("storage node exited with error: {err:?}");
                return Err(err);
            }
        }
    }

    Ok(())
}
