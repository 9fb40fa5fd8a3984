//! Outbound connector the front-end uses to relay one command to a storage
//! node.
//!
//! Every relay opens a fresh connection, sends a single [`NodeCommand`], reads
//! the single response and closes. Calls are bounded by a timeout and never
//! retried; whatever went wrong is returned to the dispatcher, which decides
//! what the client sees.

use std::future::Future;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::channel;
use crate::command::NodeCommand;
use crate::error::{DfsError, EmptyKind, Result};
use crate::path::VirtualPath;
use crate::routing::NodeSpec;
use crate::store::{StagedPayload, Staging};

/// Per-operation bounds on how long a node may take to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTimeouts {
    /// Uploads, downloads and deletes.
    pub transfer: Duration,
    pub archive: Duration,
    pub list: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self {
            transfer: Duration::from_secs(30),
            archive: Duration::from_secs(10),
            list: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeClient {
    timeouts: RelayTimeouts,
    staging: Staging,
}

struct NodeSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl NodeSession {
    async fn open(node: &NodeSpec, command: &NodeCommand) -> Result<Self> {
        let stream = TcpStream::connect(&node.addr).await?;
        let (reader, writer) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(reader),
            writer,
        };
        debug!(node = node.id, addr = %node.addr, %command, "relaying to node");
        channel::send_command_line(&mut session.writer, &command.to_string()).await?;
        Ok(session)
    }
}

impl NodeClient {
    pub fn new(timeouts: RelayTimeouts, staging: Staging) -> Self {
        Self { timeouts, staging }
    }

    /// Sends a staged payload to `dest` on the node and returns the node's
    /// acknowledgment text verbatim.
    pub async fn relay_upload(
        &self,
        node: &NodeSpec,
        dest: &VirtualPath,
        payload: &StagedPayload,
    ) -> Result<String> {
        let command = NodeCommand::Store { path: dest.clone() };
        bounded(self.timeouts.transfer, "upload relay", async {
            let mut session = NodeSession::open(node, &command).await?;
            let mut source = payload.open().await.map_err(DfsError::Storage)?;
            channel::send_payload_from(&mut session.writer, &mut source, payload.len()).await?;
            channel::recv_text(&mut session.reader).await
        })
        .await
    }

    /// Downloads `src` from the node into the staging area. A non-positive
    /// size from the node is [`DfsError::NotFound`].
    pub async fn relay_download(&self, node: &NodeSpec, src: &VirtualPath) -> Result<StagedPayload> {
        let command = NodeCommand::Fetch { path: src.clone() };
        bounded(self.timeouts.transfer, "download relay", async {
            let mut session = NodeSession::open(node, &command).await?;
            let size = channel::recv_size(&mut session.reader).await?;
            if size <= 0 {
                return Err(DfsError::NotFound(src.to_string()));
            }
            let label = src.file_name().unwrap_or("download");
            self.staging
                .receive(&mut session.reader, size as u64, label)
                .await
        })
        .await
    }

    /// Returns the node's textual reply verbatim.
    pub async fn relay_delete(&self, node: &NodeSpec, path: &VirtualPath) -> Result<String> {
        let command = NodeCommand::Delete { path: path.clone() };
        bounded(self.timeouts.transfer, "delete relay", async {
            let mut session = NodeSession::open(node, &command).await?;
            channel::recv_text(&mut session.reader).await
        })
        .await
    }

    /// Fetches the node's archive of `extension`. A zero size is
    /// [`DfsError::EmptyResult`]; a negative size means the node could not
    /// build it.
    pub async fn relay_archive(&self, node: &NodeSpec, extension: &str) -> Result<StagedPayload> {
        let command = NodeCommand::Archive {
            extension: extension.to_string(),
        };
        bounded(self.timeouts.archive, "archive relay", async {
            let mut session = NodeSession::open(node, &command).await?;
            let size = channel::recv_size(&mut session.reader).await?;
            match size {
                channel::EMPTY => Err(DfsError::EmptyResult(EmptyKind::Archive)),
                size if size < 0 => Err(DfsError::NotFound(format!(
                    "archive of {extension} files on node {}",
                    node.id
                ))),
                size => {
                    let label = format!("{}.tar", extension.trim_start_matches('.'));
                    self.staging
                        .receive(&mut session.reader, size as u64, &label)
                        .await
                }
            }
        })
        .await
    }

    /// Names the node reports for `directory`, in the order it sent them.
    pub async fn relay_list(&self, node: &NodeSpec, directory: &VirtualPath) -> Result<Vec<String>> {
        let command = NodeCommand::List {
            directory: directory.clone(),
        };
        bounded(self.timeouts.list, "list relay", async {
            let mut session = NodeSession::open(node, &command).await?;
            let text = channel::recv_text(&mut session.reader).await?;
            Ok(text
                .lines()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect())
        })
        .await
    }
}

async fn bounded<T, F>(limit: Duration, what: &str, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(DfsError::timed_out(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn scripted_node<F, Fut>(script: F) -> NodeSpec
    where
        F: FnOnce(BufReader<OwnedReadHalf>, OwnedWriteHalf) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, writer) = stream.into_split();
            script(BufReader::new(reader), writer).await;
        });
        NodeSpec {
            id: 2,
            extension: ".pdf".into(),
            addr: addr.to_string(),
        }
    }

    fn client(root: &std::path::Path) -> NodeClient {
        NodeClient::new(
            RelayTimeouts {
                transfer: Duration::from_secs(2),
                archive: Duration::from_secs(2),
                list: Duration::from_millis(200),
            },
            Staging::under_root(root),
        )
    }

    #[tokio::test]
    async fn upload_returns_the_node_acknowledgment_verbatim() {
        let root = tempfile::tempdir().unwrap();
        let node = scripted_node(|mut reader, mut writer| async move {
            let line = channel::recv_command_line(&mut reader).await.unwrap();
            assert_eq!(line.as_deref(), Some("uploadf ~S2/docs/report.pdf"));
            let body = channel::recv_framed(&mut reader).await.unwrap();
            assert_eq!(body.as_deref(), Some(&b"%PDF"[..]));
            channel::send_text(&mut writer, "Failed to store file.").await.unwrap();
        })
        .await;

        let staging = Staging::under_root(root.path());
        let payload = staging.receive(&mut &b"%PDF"[..], 4, "report.pdf").await.unwrap();
        let dest = VirtualPath::parse("~S2/docs/report.pdf").unwrap();
        let ack = client(root.path())
            .relay_upload(&node, &dest, &payload)
            .await
            .unwrap();
        assert_eq!(ack, "Failed to store file.");
    }

    #[tokio::test]
    async fn download_maps_non_positive_size_to_not_found() {
        let root = tempfile::tempdir().unwrap();
        let node = scripted_node(|mut reader, mut writer| async move {
            let line = channel::recv_command_line(&mut reader).await.unwrap();
            assert_eq!(line.as_deref(), Some("downlf ~S2/docs/missing.pdf"));
            channel::send_size(&mut writer, 0).await.unwrap();
        })
        .await;

        let path = VirtualPath::parse("~S2/docs/missing.pdf").unwrap();
        let result = client(root.path()).relay_download(&node, &path).await;
        assert!(matches!(result, Err(DfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn download_detects_a_node_dying_mid_stream() {
        let root = tempfile::tempdir().unwrap();
        let node = scripted_node(|mut reader, mut writer| async move {
            channel::recv_command_line(&mut reader).await.unwrap();
            channel::send_size(&mut writer, 100).await.unwrap();
            writer.write_all(b"only a part").await.unwrap();
        })
        .await;

        let path = VirtualPath::parse("~S2/big.pdf").unwrap();
        let result = client(root.path()).relay_download(&node, &path).await;
        assert!(matches!(
            result,
            Err(DfsError::TruncatedTransfer {
                expected: 100,
                received: 11
            })
        ));
    }

    #[tokio::test]
    async fn list_times_out_on_a_silent_node() {
        let root = tempfile::tempdir().unwrap();
        let node = scripted_node(|reader, writer| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop((reader, writer));
        })
        .await;

        let dir = VirtualPath::parse("~S2/docs").unwrap();
        let err = client(root.path()).relay_list(&node, &dir).await.unwrap_err();
        assert!(matches!(&err, DfsError::Connection(io) if io.kind() == std::io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn unreachable_node_is_a_connection_error() {
        let root = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let node = NodeSpec {
            id: 3,
            extension: ".txt".into(),
            addr: addr.to_string(),
        };

        let path = VirtualPath::parse("~S3/a.txt").unwrap();
        let err = client(root.path()).relay_delete(&node, &path).await.unwrap_err();
        assert!(matches!(err, DfsError::Connection(_)));
    }

    #[tokio::test]
    async fn archive_distinguishes_empty_from_failure() {
        let root = tempfile::tempdir().unwrap();
        let empty = scripted_node(|mut reader, mut writer| async move {
            channel::recv_command_line(&mut reader).await.unwrap();
            channel::send_size(&mut writer, channel::EMPTY).await.unwrap();
        })
        .await;
        let failed = scripted_node(|mut reader, mut writer| async move {
            channel::recv_command_line(&mut reader).await.unwrap();
            channel::send_sentinel(&mut writer).await.unwrap();
        })
        .await;

        let client = client(root.path());
        assert!(matches!(
            client.relay_archive(&empty, ".pdf").await,
            Err(DfsError::EmptyResult(EmptyKind::Archive))
        ));
        assert!(matches!(
            client.relay_archive(&failed, ".pdf").await,
            Err(DfsError::NotFound(_))
        ));
    }
}
