//! Per-connection command loop of the front-end.
//!
//! A session reads one command line, executes it to completion and writes the
//! reply before reading the next one. The reply shape depends only on the verb:
//!
//! | verb         | reply                                                  |
//! |--------------|--------------------------------------------------------|
//! | `uploadf`    | text                                                   |
//! | `downlf`     | size header, then bytes when the size is positive      |
//! | `removef`    | text                                                   |
//! | `downltar`   | size header, then archive bytes or an explanatory text |
//! | `dispfnames` | text                                                   |
//!
//! Storage node failures are turned into replies and never end the session.
//! Only a failure on the client stream itself does.

use nanoid::nanoid;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::channel::{self, CommandLine};
use crate::command::{self, Command};
use crate::error::{DfsError, EmptyKind, Result};
use crate::listing;
use crate::node_client::NodeClient;
use crate::path::VirtualPath;
use crate::routing::{RoutingTable, RoutingTarget};
use crate::store::{LocalStore, Staging};

pub const STORED: &str = "File stored successfully.";
pub const EMPTY_UPLOAD: &str = "Upload contained no data.";
pub const INVALID_EXTENSION: &str = "Invalid file extension.";
pub const DELETED: &str = "File deleted.";
pub const DELETE_FAILED: &str = "File not found or cannot delete.";
pub const ARCHIVE_FAILED: &str = "Failed to create tar archive.";

pub struct Dispatcher {
    routes: RoutingTable,
    store: LocalStore,
    staging: Staging,
    nodes: NodeClient,
}

impl Dispatcher {
    pub fn new(routes: RoutingTable, store: LocalStore, staging: Staging, nodes: NodeClient) -> Self {
        Self {
            routes,
            store,
            staging,
            nodes,
        }
    }

    /// Runs the command loop until the client disconnects. An error means the
    /// client stream broke and the session was abandoned.
    pub async fn serve<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        while let Some(line) = channel::recv_command_line(reader).await? {
            let command = match line.decoded().and_then(Command::parse) {
                Ok(command) => command,
                Err(err) => {
                    debug!(%line, error = %err, "rejected command");
                    reject(&line, &err, reader, writer).await?;
                    continue;
                }
            };

            let span = info_span!("command", op = %nanoid!(10), name = command.name());
            self.execute(command, reader, writer).instrument(span).await?;
        }
        Ok(())
    }

    async fn execute<R, W>(&self, command: Command, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        match command {
            Command::Store {
                filename,
                destination,
            } => self.store(&filename, &destination, reader, writer).await,
            Command::Fetch { path } => self.fetch(&path, writer).await,
            Command::Delete { path } => self.delete(&path, writer).await,
            Command::ArchiveByType { extension } => self.archive(&extension, writer).await,
            Command::ListNames { directory } => self.list(&directory, writer).await,
        }
    }

    async fn store<R, W>(
        &self,
        filename: &str,
        destination: &VirtualPath,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<()>
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

        let target = match self.upload_target(filename, destination) {
            Ok(target) => target,
            Err(reply) => {
                channel::drain(reader, len).await?;
                channel::send_text(writer, &reply).await?;
                return Ok(());
            }
        };

        let payload = match self.staging.receive(reader, len, filename).await {
            Ok(payload) => payload,
            Err(err) if err.breaks_stream() => return Err(err),
            Err(err) => {
                warn!(error = %err, "could not stage upload");
                channel::send_text(writer, &err.reply_text()).await?;
                return Ok(());
            }
        };

        let reply = match self.routes.classify(&target) {
            RoutingTarget::Local => match self.store.persist(payload, &target).await {
                Ok(()) => {
                    info!(dest = %target, bytes = len, "stored locally");
                    STORED.to_string()
                }
                Err(err) => {
                    warn!(dest = %target, error = %err, "local store failed");
                    err.reply_text()
                }
            },
            RoutingTarget::Remote(node) => {
                let rewritten = self.routes.rewrite_for_node(&target, node);
                match self.nodes.relay_upload(node, &rewritten, &payload).await {
                    Ok(ack) => {
                        info!(node = node.id, dest = %rewritten, bytes = len, "upload relayed");
                        ack
                    }
                    Err(err) => {
                        warn!(node = node.id, dest = %rewritten, error = %err, "upload relay failed");
                        err.reply_text()
                    }
                }
            }
            RoutingTarget::Unsupported => {
                DfsError::UnsupportedType(target.to_string()).reply_text()
            }
        };
        channel::send_text(writer, &reply).await?;
        Ok(())
    }

    /// Full destination path of an upload, or the text explaining why the
    /// upload is refused before its bytes are kept.
    fn upload_target(
        &self,
        filename: &str,
        destination: &VirtualPath,
    ) -> std::result::Result<VirtualPath, String> {
        if !destination.is_rooted_at(self.routes.marker()) {
            return Err(self.invalid_destination().reply_text());
        }
        let target = destination.join_file(filename).map_err(|err| err.reply_text())?;
        match self.routes.classify(&target) {
            RoutingTarget::Unsupported if target.extension().is_none() => {
                Err(INVALID_EXTENSION.to_string())
            }
            RoutingTarget::Unsupported => {
                Err(DfsError::UnsupportedType(target.to_string()).reply_text())
            }
            _ => Ok(target),
        }
    }

    async fn fetch<W>(&self, path: &VirtualPath, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !path.is_rooted_at(self.routes.marker()) {
            channel::send_sentinel(writer).await?;
            return Ok(());
        }

        match self.routes.classify(path) {
            RoutingTarget::Local => match self.store.open(path).await {
                Ok(Some((mut file, len))) => {
                    channel::send_payload_from(writer, &mut file, len).await?;
                    info!(%path, bytes = len, "served locally");
                }
                Ok(None) => channel::send_sentinel(writer).await?,
                Err(err) => {
                    warn!(%path, error = %err, "local fetch failed");
                    channel::send_sentinel(writer).await?;
                }
            },
            RoutingTarget::Remote(node) => {
                let rewritten = self.routes.rewrite_for_node(path, node);
                let staged = match self.nodes.relay_download(node, &rewritten).await {
                    Ok(staged) => staged,
                    Err(err) => {
                        debug!(node = node.id, %rewritten, error = %err, "remote fetch yielded nothing");
                        channel::send_sentinel(writer).await?;
                        return Ok(());
                    }
                };
                let mut file = match staged.open().await {
                    Ok(file) => file,
                    Err(err) => {
                        warn!(error = %err, "staged download vanished");
                        channel::send_sentinel(writer).await?;
                        return Ok(());
                    }
                };
                channel::send_payload_from(writer, &mut file, staged.len()).await?;
                info!(node = node.id, %rewritten, bytes = staged.len(), "download relayed");
            }
            RoutingTarget::Unsupported => channel::send_sentinel(writer).await?,
        }
        Ok(())
    }

    async fn delete<W>(&self, path: &VirtualPath, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !path.is_rooted_at(self.routes.marker()) {
            channel::send_text(writer, &self.invalid_destination().reply_text()).await?;
            return Ok(());
        }

        let reply = match self.routes.classify(path) {
            RoutingTarget::Local => match self.store.delete(path).await {
                Ok(true) => {
                    info!(%path, "deleted locally");
                    DELETED.to_string()
                }
                Ok(false) => DELETE_FAILED.to_string(),
                Err(DfsError::Storage(err)) => {
                    warn!(%path, error = %err, "local delete failed");
                    DELETE_FAILED.to_string()
                }
                Err(err) => err.reply_text(),
            },
            RoutingTarget::Remote(node) => {
                let rewritten = self.routes.rewrite_for_node(path, node);
                match self.nodes.relay_delete(node, &rewritten).await {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(node = node.id, %rewritten, error = %err, "delete relay failed");
                        err.reply_text()
                    }
                }
            }
            RoutingTarget::Unsupported => DfsError::UnsupportedType(path.to_string()).reply_text(),
        };
        channel::send_text(writer, &reply).await?;
        Ok(())
    }

    async fn archive<W>(&self, extension: &str, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let outcome = match self.routes.classify_extension(Some(extension)) {
            RoutingTarget::Local => self
                .store
                .archive(&self.staging)
                .await
                .and_then(|archive| {
                    archive.ok_or(DfsError::EmptyResult(EmptyKind::Archive))
                }),
            RoutingTarget::Remote(node) => self.nodes.relay_archive(node, extension).await,
            RoutingTarget::Unsupported => Err(DfsError::UnsupportedType(extension.to_string())),
        };

        match outcome {
            Ok(archive) => {
                let mut file = match archive.open().await {
                    Ok(file) => file,
                    Err(err) => {
                        warn!(error = %err, "staged archive vanished");
                        return send_archive_refusal(writer, channel::NOT_FOUND, ARCHIVE_FAILED)
                            .await;
                    }
                };
                channel::send_payload_from(writer, &mut file, archive.len()).await?;
                info!(extension, bytes = archive.len(), "archive sent");
                Ok(())
            }
            Err(err @ DfsError::EmptyResult(_)) => {
                send_archive_refusal(writer, channel::EMPTY, &err.reply_text()).await
            }
            Err(err) => {
                warn!(extension, error = %err, "archive failed");
                let text = match err {
                    DfsError::UnsupportedType(_) | DfsError::Connection(_) => err.reply_text(),
                    _ => ARCHIVE_FAILED.to_string(),
                };
                send_archive_refusal(writer, channel::NOT_FOUND, &text).await
            }
        }
    }

    async fn list<W>(&self, directory: &VirtualPath, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !directory.is_rooted_at(self.routes.marker()) {
            channel::send_text(writer, &self.invalid_destination().reply_text()).await?;
            return Ok(());
        }

        let reply = match listing::aggregate(&self.routes, &self.store, &self.nodes, directory).await
        {
            Ok(listing) if listing.is_empty() => {
                DfsError::EmptyResult(EmptyKind::Listing).reply_text()
            }
            Ok(listing) => listing.render(),
            Err(err @ (DfsError::InvalidDestination { .. } | DfsError::PathEscape(_))) => {
                err.reply_text()
            }
            Err(err) => {
                warn!(%directory, error = %err, "local listing failed");
                DfsError::EmptyResult(EmptyKind::Listing).reply_text()
            }
        };
        channel::send_text(writer, &reply).await?;
        Ok(())
    }

    fn invalid_destination(&self) -> DfsError {
        DfsError::InvalidDestination {
            expected: self.routes.marker().to_string(),
        }
    }
}

/// Size header followed by the reason no archive bytes follow.
async fn send_archive_refusal<W>(writer: &mut W, size: i64, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    channel::send_size(writer, size).await?;
    channel::send_text(writer, text).await?;
    Ok(())
}

/// Answers a line that did not parse, in the reply shape its verb promises.
/// A rejected upload still has its payload consumed.
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
        Some(command::DOWNLOAD) => channel::send_sentinel(writer).await?,
        Some(command::ARCHIVE) => {
            send_archive_refusal(writer, channel::NOT_FOUND, &err.reply_text()).await?
        }
        _ => channel::send_text(writer, &err.reply_text()).await?,
    }
    Ok(())
}
