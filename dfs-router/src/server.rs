//! TCP accept loop shared by the front-end and the storage node.
//!
//! Each accepted connection gets its own task. Shutdown stops accepting, then
//! gives in-flight connections a grace period to finish before aborting them.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{FrontEndConfig, StorageNodeConfig};
use crate::dispatcher::Dispatcher;
use crate::error::DfsError;
use crate::node_client::NodeClient;
use crate::storage_node::NodeService;
use crate::store::{LocalStore, Staging};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Something that can serve one accepted connection.
pub trait Service: Send + Sync + 'static {
    fn serve_connection(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> impl Future<Output = Result<(), DfsError>> + Send;
}

impl Service for Dispatcher {
    async fn serve_connection(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), DfsError> {
        self.serve(reader, writer).await
    }
}

impl Service for NodeService {
    async fn serve_connection(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), DfsError> {
        self.serve(reader, writer).await
    }
}

pub struct Server<S> {
    listener: TcpListener,
    service: Arc<S>,
    role: &'static str,
}

pub type FrontEnd = Server<Dispatcher>;
pub type StorageNode = Server<NodeService>;

impl Server<Dispatcher> {
    pub fn new(listener: TcpListener, config: FrontEndConfig) -> Self {
        let staging = Staging::under_root(&config.root);
        let store = LocalStore::new(
            &config.root,
            config.routes.marker(),
            config.routes.local_extension(),
        );
        let nodes = NodeClient::new(config.timeouts, staging.clone());
        let dispatcher = Dispatcher::new(config.routes, store, staging, nodes);
        Self::with_service(listener, dispatcher, "front-end")
    }
}

impl Server<NodeService> {
    pub fn new(listener: TcpListener, config: StorageNodeConfig) -> Self {
        let staging = Staging::under_root(&config.root);
        let store = LocalStore::new(&config.root, &config.marker, &config.extension);
        Self::with_service(listener, NodeService::new(store, staging), "storage node")
    }
}

impl<S: Service> Server<S> {
    pub fn with_service(listener: TcpListener, service: S, role: &'static str) -> Self {
        Self {
            listener,
            service: Arc::new(service),
            role,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            service,
            role,
        } = self;
        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(role, in_flight = workers.len(), "shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &service, &mut workers);
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        drain_workers(workers).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result<S: Service>(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    service: &Arc<S>,
    workers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let service = Arc::clone(service);
            workers.spawn(async move {
                handle_connection(stream, peer, service).await;
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection<S: Service>(stream: TcpStream, peer: SocketAddr, service: Arc<S>) {
    debug!(peer = %peer, "connection accepted");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    match service.serve_connection(&mut reader, &mut writer).await {
        Ok(()) => debug!(peer = %peer, "connection closed"),
        Err(err) => warn!(peer = %peer, error = %err, "connection closed with error"),
    }
}

async fn drain_workers(mut workers: JoinSet<()>) {
    if workers.is_empty() {
        return;
    }
    let finished = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        warn!(remaining = workers.len(), "aborting connections still open after grace period");
        workers.shutdown().await;
    }
}
