//! Reference storage node: owns one extension under one marker and answers
//! the node-facing sub-protocol.
//!
//! Replies differ from the front-end's in a few places. Fetch and archive send
//! only a size header when there is nothing to send, and delete reports
//! "File removed." / "File not found.".

use nanoid::nanoid;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::channel::{self, CommandLine};
use crate::command::{self, NodeCommand};
use crate::dispatcher::{EMPTY_UPLOAD, STORED};
use crate::error::{DfsError, Result};
use crate::path::VirtualPath;
use crate::store::{LocalStore, Staging};

pub const REMOVED: &str = "File removed.";
pub const NOT_FOUND_TEXT: &str = "File not found.";

pub struct NodeService {
    store: LocalStore,
    staging: Staging,
}

impl NodeService {
    pub fn new(store: LocalStore, staging: Staging) -> Self {
        Self { store, staging }
    }

    /// Serves requests until the peer closes the connection. The front-end
    /// sends one request per connection, but any number is accepted.
    pub async fn serve<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        while let Some(line) = channel::recv_command_line(reader).await? {
            let request = match line.decoded().and_then(NodeCommand::parse) {
                Ok(request) => request,
                Err(err) => {
                    debug!(%line, error = %err, "rejected node request");
                    reject(&line, &err, reader, writer).await?;
                    continue;
                }
            };

            let span = info_span!("request", op = %nanoid!(10), %request);
            self.execute(request, reader, writer).instrument(span).await?;
        }
        Ok(())
    }

    async fn execute<R, W>(&self, request: NodeCommand, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        match request {
            NodeCommand::Store { path } => self.store_file(&path, reader, writer).await,
            NodeCommand::Fetch { path } => self.fetch(&path, writer).await,
            NodeCommand::Delete { path } => self.delete(&path, writer).await,
            NodeCommand::Archive { extension } => self.archive(&extension, writer).await,
            NodeCommand::List { directory } => self.list(&directory, writer).await,
        }
    }

    fn check_owned(&self, path: &VirtualPath) -> Result<()> {
        if !path.is_rooted_at(self.store.marker()) {
            return Err(DfsError::InvalidDestination {
                expected: self.store.marker().to_string(),
            });
        }
        if !self.store.owns(path) {
            return Err(DfsError::UnsupportedType(path.to_string()));
        }
        Ok(())
    }

    async fn store_file<R, W>(&self, path: &VirtualPath, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let size = channel::recv_size(reader).await?;
        if size <= 0 {
            channel::send_text(writer, EMPTY_UPLOAD).await?;
            return Ok(());
        }
        let len = size as u64;

        if let Err(err) = self.check_owned(path) {
            channel::drain(reader, len).await?;
            channel::send_text(writer, &err.reply_text()).await?;
            return Ok(());
        }

        let label = path.file_name().unwrap_or("upload");
        let stored = match self.staging.receive(reader, len, label).await {
            Ok(payload) => self.store.persist(payload, path).await,
            Err(err) if err.breaks_stream() => return Err(err),
            Err(err) => Err(err),
        };
        let reply = match stored {
            Ok(()) => {
                info!(%path, bytes = len, "file stored");
                STORED.to_string()
            }
            Err(err) => {
                warn!(%path, error = %err, "store failed");
                err.reply_text()
            }
        };
        channel::send_text(writer, &reply).await?;
        Ok(())
    }

    async fn fetch<W>(&self, path: &VirtualPath, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.check_owned(path).is_err() {
            channel::send_sentinel(writer).await?;
            return Ok(());
        }
        match self.store.open(path).await {
            Ok(Some((mut file, len))) => {
                channel::send_payload_from(writer, &mut file, len).await?;
                info!(%path, bytes = len, "file served");
            }
            Ok(None) => channel::send_sentinel(writer).await?,
            Err(err) => {
                warn!(%path, error = %err, "fetch failed");
                channel::send_sentinel(writer).await?;
            }
        }
        Ok(())
    }

    async fn delete<W>(&self, path: &VirtualPath, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let reply = match self.check_owned(path) {
            Err(err @ DfsError::InvalidDestination { .. }) => err.reply_text(),
            Err(_) => NOT_FOUND_TEXT.to_string(),
            Ok(()) => match self.store.delete(path).await {
                Ok(true) => {
                    info!(%path, "file removed");
                    REMOVED.to_string()
                }
                Ok(false) => NOT_FOUND_TEXT.to_string(),
                Err(err) => {
                    warn!(%path, error = %err, "delete failed");
                    NOT_FOUND_TEXT.to_string()
                }
            },
        };
        channel::send_text(writer, &reply).await?;
        Ok(())
    }

    async fn archive<W>(&self, extension: &str, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if extension != self.store.extension() {
            channel::send_sentinel(writer).await?;
            return Ok(());
        }
        match self.store.archive(&self.staging).await {
            Ok(Some(archive)) => {
                let mut file = match archive.open().await {
                    Ok(file) => file,
                    Err(err) => {
                        warn!(error = %err, "staged archive vanished");
                        channel::send_sentinel(writer).await?;
                        return Ok(());
                    }
                };
                channel::send_payload_from(writer, &mut file, archive.len()).await?;
                info!(bytes = archive.len(), "archive served");
            }
            Ok(None) => channel::send_size(writer, channel::EMPTY).await?,
            Err(err) => {
                warn!(error = %err, "archive failed");
                channel::send_sentinel(writer).await?;
            }
        }
        Ok(())
    }

    async fn list<W>(&self, directory: &VirtualPath, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let names = match self.store.list(directory).await {
            Ok(names) => names,
            Err(err) => {
                debug!(%directory, error = %err, "listing failed");
                Vec::new()
            }
        };
        let body: String = names.iter().map(|name| format!("{name}\n")).collect();
        channel::send_text(writer, &body).await?;
        Ok(())
    }
}

async fn reject<R, W>(
    line: &CommandLine,
    err: &DfsError,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match line.verb() {
        Some(command::UPLOAD) => {
            let size = channel::recv_size(reader).await?;
            if size > 0 {
                channel::drain(reader, size as u64).await?;
            }
            channel::send_text(writer, &err.reply_text()).await?;
        }
        Some(command::DOWNLOAD) | Some(command::ARCHIVE) => channel::send_sentinel(writer).await?,
        _ => channel::send_text(writer, &err.reply_text()).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    async fn run(root: &std::path::Path, input: Vec<u8>) -> Vec<u8> {
        let service = NodeService::new(
            LocalStore::new(root, "~S2", ".pdf"),
            Staging::under_root(root),
        );
        let mut reader = BufReader::new(input.as_slice());
        let mut output = Vec::new();
        service.serve(&mut reader, &mut output).await.unwrap();
        output
    }

    fn upload(path: &str, bytes: &[u8]) -> Vec<u8> {
        let mut input = format!("uploadf {path}\n").into_bytes();
        input.extend_from_slice(&(bytes.len() as i64).to_le_bytes());
        input.extend_from_slice(bytes);
        input
    }

    async fn texts(mut output: &[u8]) -> Vec<String> {
        let mut replies = Vec::new();
        while !output.is_empty() {
            replies.push(channel::recv_text(&mut output).await.unwrap());
        }
        replies
    }

    #[tokio::test]
    async fn stores_under_the_marker_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut input = upload("~S2/docs/report.pdf", b"hello");
        input.extend(upload("~S1/docs/report.pdf", b"wrong marker"));
        input.extend(upload("~S2/docs/notes.txt", b"wrong type"));

        let output = run(root.path(), input).await;
        assert_eq!(
            texts(&output).await,
            vec![
                STORED.to_string(),
                "Destination must start with ~S2.".to_string(),
                "Unsupported file type.".to_string(),
            ]
        );
        assert_eq!(
            fs::read(root.path().join("S2/docs/report.pdf")).unwrap(),
            b"hello"
        );
        assert!(!root.path().join("S2/docs/notes.txt").exists());
    }

    #[tokio::test]
    async fn fetch_sends_bytes_or_the_sentinel() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("S2/docs")).unwrap();
        fs::write(root.path().join("S2/docs/a.pdf"), b"%PDF").unwrap();

        let input = b"downlf ~S2/docs/a.pdf\ndownlf ~S2/docs/missing.pdf\n".to_vec();
        let output = run(root.path(), input).await;

        let mut cursor = output.as_slice();
        assert_eq!(channel::recv_size(&mut cursor).await.unwrap(), 4);
        let mut body = [0u8; 4];
        cursor.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"%PDF");
        assert_eq!(channel::recv_size(&mut cursor).await.unwrap(), channel::NOT_FOUND);
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("S2")).unwrap();
        fs::write(root.path().join("S2/a.pdf"), b"x").unwrap();

        let input = b"removef ~S2/a.pdf\nremovef ~S2/a.pdf\n".to_vec();
        let output = run(root.path(), input).await;
        assert_eq!(texts(&output).await, vec![REMOVED, NOT_FOUND_TEXT]);
    }

    #[tokio::test]
    async fn archive_signals_empty_and_foreign_types_by_size() {
        let root = tempfile::tempdir().unwrap();
        let input = b"downltar pdf\ndownltar zip\n".to_vec();
        let output = run(root.path(), input).await;

        let mut cursor = output.as_slice();
        assert_eq!(channel::recv_size(&mut cursor).await.unwrap(), channel::EMPTY);
        assert_eq!(channel::recv_size(&mut cursor).await.unwrap(), channel::NOT_FOUND);
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn list_is_a_possibly_empty_text_frame() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("S2/docs")).unwrap();
        for name in ["b.pdf", "a.pdf", "skip.txt"] {
            fs::write(root.path().join("S2/docs").join(name), name).unwrap();
        }

        let input = b"dispfnames ~S2/docs\ndispfnames ~S2/empty\n".to_vec();
        let output = run(root.path(), input).await;
        assert_eq!(texts(&output).await, vec!["a.pdf\nb.pdf\n", ""]);
    }

    #[tokio::test]
    async fn malformed_upload_is_drained_before_replying() {
        let root = tempfile::tempdir().unwrap();
        let mut input = b"uploadf report.pdf ~S2/docs\n".to_vec();
        input.extend_from_slice(&3i64.to_le_bytes());
        input.extend_from_slice(b"abc");
        input.extend_from_slice(b"removef ~S2/none.pdf\n");

        let output = run(root.path(), input).await;
        assert_eq!(texts(&output).await, vec!["Invalid command.", NOT_FOUND_TEXT]);
    }

    #[tokio::test]
    async fn non_utf8_request_gets_a_reply_in_its_verb_shape() {
        let root = tempfile::tempdir().unwrap();
        let mut input = b"downlf ~S2/\xff.pdf\n".to_vec();
        input.extend_from_slice(b"removef ~S2/\xfe.pdf\n");

        let output = run(root.path(), input).await;
        let mut cursor = output.as_slice();
        assert_eq!(channel::recv_size(&mut cursor).await.unwrap(), channel::NOT_FOUND);
        assert_eq!(texts(cursor).await, vec!["Invalid command."]);
    }

    #[tokio::test]
    async fn truncated_upload_breaks_the_session() {
        let root = tempfile::tempdir().unwrap();
        let mut input = b"uploadf ~S2/a.pdf\n".to_vec();
        input.extend_from_slice(&10i64.to_le_bytes());
        input.extend_from_slice(b"abc");

        let service = NodeService::new(
            LocalStore::new(root.path(), "~S2", ".pdf"),
            Staging::under_root(root.path()),
        );
        let mut reader = BufReader::new(input.as_slice());
        let mut output = Vec::new();
        let result = service.serve(&mut reader, &mut output).await;
        assert!(matches!(result, Err(DfsError::TruncatedTransfer { .. })));
        assert!(!root.path().join("S2/a.pdf").exists());
        output.flush().await.unwrap();
        assert!(output.is_empty());
    }
}
