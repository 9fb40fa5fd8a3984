//! Framing helpers for the text-command / sized-payload wire protocol.
//!
//! Commands travel as newline-terminated lines. Everything else (payloads,
//! status texts, listings) is a transfer: an 8-byte little-endian `i64` length
//! followed by exactly that many bytes. A non-positive length carries no bytes
//! and signals "not found" (`-1`) or "empty" (`0`).

use std::fmt;
use std::io;
use std::ops::Deref;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DfsError, Result};

pub const SIZE_HEADER_LEN: usize = 8;
pub const NOT_FOUND: i64 = -1;
pub const EMPTY: i64 = 0;

const MAX_COMMAND_LEN: u64 = 4096;
// Upper bound for transfers that are buffered in memory (texts, listings).
const MAX_BUFFERED_FRAME: i64 = 16 * 1024 * 1024;
const CHUNK_SIZE: usize = 8 * 1024;

/// One received command line with its line ending stripped.
///
/// Bytes that are not UTF-8 still form a complete line, so the stream stays
/// aligned; such a line is kept lossily for logging and its verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    text: String,
    utf8: bool,
}

impl CommandLine {
    fn from_bytes(mut bytes: Vec<u8>) -> Self {
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        match String::from_utf8(bytes) {
            Ok(text) => Self { text, utf8: true },
            Err(err) => Self {
                text: String::from_utf8_lossy(err.as_bytes()).into_owned(),
                utf8: false,
            },
        }
    }

    /// The line as text, or [`DfsError::InvalidCommand`] when it was not UTF-8.
    pub fn decoded(&self) -> Result<&str> {
        if self.utf8 {
            Ok(&self.text)
        } else {
            Err(DfsError::InvalidCommand(format!(
                "line is not valid UTF-8: {}",
                self.text
            )))
        }
    }

    pub fn verb(&self) -> Option<&str> {
        self.text.split_whitespace().next()
    }
}

impl Deref for CommandLine {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Reads the next non-blank command line. Returns `None` once the peer closes
/// the stream.
pub async fn recv_command_line<R>(reader: &mut R) -> io::Result<Option<CommandLine>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut buffer = Vec::new();
        let bytes = (&mut *reader)
            .take(MAX_COMMAND_LEN)
            .read_until(b'\n', &mut buffer)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if buffer.last() != Some(&b'\n') && bytes as u64 == MAX_COMMAND_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "command line exceeds 4096 bytes",
            ));
        }

        let line = CommandLine::from_bytes(buffer);
        if line.trim().is_empty() {
            continue;
        }
        return Ok(Some(line));
    }
}

pub async fn send_command_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

pub async fn send_size<W>(writer: &mut W, size: i64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&size.to_le_bytes()).await?;
    writer.flush().await
}

pub async fn recv_size<R>(reader: &mut R) -> Result<i64>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; SIZE_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    Ok(i64::from_le_bytes(header))
}

pub async fn send_sentinel<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_size(writer, NOT_FOUND).await
}

pub async fn send_framed<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = i64::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Reads one transfer into memory. `None` means the sender signalled a
/// non-positive length.
pub async fn recv_framed<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let size = recv_size(reader).await?;
    if size <= 0 {
        return Ok(None);
    }
    if size > MAX_BUFFERED_FRAME {
        return Err(DfsError::Connection(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {size} bytes exceeds the in-memory limit"),
        )));
    }

    let mut buffer = Vec::with_capacity(size as usize);
    recv_payload_into(reader, &mut buffer, size as u64).await?;
    Ok(Some(buffer))
}

pub async fn send_text<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_framed(writer, text.as_bytes()).await
}

pub async fn recv_text<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let bytes = recv_framed(reader).await?.unwrap_or_default();
    String::from_utf8(bytes).map_err(|err| {
        DfsError::Connection(io::Error::new(io::ErrorKind::InvalidData, err))
    })
}

/// Moves exactly `len` bytes from `reader` into `sink`, reading until the
/// count is reached no matter how the stream chunks them.
///
/// A failing sink does not stop the loop: the remaining bytes are still
/// drained so the stream stays aligned on the next frame, and the sink error
/// is reported afterwards as [`DfsError::Storage`].
pub async fn recv_payload_into<R, W>(reader: &mut R, sink: &mut W, len: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut received = 0u64;
    let mut sink_error = None;

    while received < len {
        let want = (len - received).min(CHUNK_SIZE as u64) as usize;
        let n = reader.read(&mut buffer[..want]).await?;
        if n == 0 {
            return Err(DfsError::TruncatedTransfer {
                expected: len,
                received,
            });
        }
        if sink_error.is_none() {
            if let Err(err) = sink.write_all(&buffer[..n]).await {
                sink_error = Some(err);
            }
        }
        received += n as u64;
    }

    if let Some(err) = sink_error {
        return Err(DfsError::Storage(err));
    }
    sink.flush().await.map_err(DfsError::Storage)
}

/// Discards exactly `len` bytes so the next command can be read.
pub async fn drain<R>(reader: &mut R, len: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    recv_payload_into(reader, &mut tokio::io::sink(), len).await
}

/// Sends a size header followed by exactly `len` bytes read from `source`.
pub async fn send_payload_from<W, S>(writer: &mut W, source: &mut S, len: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
    S: AsyncRead + Unpin,
{
    let size = i64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    writer.write_all(&size.to_le_bytes()).await?;

    let copied = tokio::io::copy(&mut (&mut *source).take(len), &mut *writer).await?;
    if copied != len {
        return Err(DfsError::TruncatedTransfer {
            expected: len,
            received: copied,
        });
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn framed_payload_survives_byte_sized_writes() {
        let (mut writer, reader) = tokio::io::duplex(4);
        let mut reader = BufReader::new(reader);
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let expected = payload.clone();

        let sender = tokio::spawn(async move {
            let mut encoded = (payload.len() as i64).to_le_bytes().to_vec();
            encoded.extend_from_slice(&payload);
            for byte in encoded {
                writer.write_all(&[byte]).await.expect("write byte");
            }
        });

        let received = recv_framed(&mut reader)
            .await
            .expect("read frame")
            .expect("positive frame");
        sender.await.expect("sender task");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn short_payload_is_reported_as_truncated() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&10i64.to_le_bytes()).await.unwrap();
        writer.write_all(b"abc").await.unwrap();
        drop(writer);

        let err = recv_framed(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            DfsError::TruncatedTransfer {
                expected: 10,
                received: 3
            }
        ));
    }

    #[tokio::test]
    async fn sentinel_frames_carry_no_bytes() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        send_sentinel(&mut writer).await.unwrap();
        send_text(&mut writer, "next").await.unwrap();

        assert!(recv_framed(&mut reader).await.unwrap().is_none());
        assert_eq!(recv_text(&mut reader).await.unwrap(), "next");
    }

    #[tokio::test]
    async fn command_lines_skip_blanks_and_strip_crlf() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = BufReader::new(reader);
        writer
            .write_all(b"\r\n   \ndownlf ~S1/a.c\r\nremovef ~S1/b.c\n")
            .await
            .unwrap();
        drop(writer);

        assert_eq!(
            recv_command_line(&mut reader).await.unwrap().as_deref(),
            Some("downlf ~S1/a.c")
        );
        assert_eq!(
            recv_command_line(&mut reader).await.unwrap().as_deref(),
            Some("removef ~S1/b.c")
        );
        assert!(recv_command_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_utf8_line_is_consumed_whole() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = BufReader::new(reader);
        writer
            .write_all(b"removef ~S1/\xff\xfe.c\ndispfnames ~S1\n")
            .await
            .unwrap();
        drop(writer);

        let line = recv_command_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line.verb(), Some("removef"));
        assert!(matches!(line.decoded(), Err(DfsError::InvalidCommand(_))));

        let next = recv_command_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(next.decoded().unwrap(), "dispfnames ~S1");
    }

    #[tokio::test]
    async fn command_line_followed_by_payload_shares_one_reader() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = BufReader::new(reader);
        send_command_line(&mut writer, "uploadf a.c ~S1").await.unwrap();
        send_framed(&mut writer, b"int main;").await.unwrap();

        let line = recv_command_line(&mut reader).await.unwrap();
        assert_eq!(line.as_deref(), Some("uploadf a.c ~S1"));
        let payload = recv_framed(&mut reader).await.unwrap();
        assert_eq!(payload.as_deref(), Some(&b"int main;"[..]));
    }

    #[tokio::test]
    async fn failing_sink_still_drains_the_stream() {
        struct BrokenSink;
        impl AsyncWrite for BrokenSink {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
                _: &[u8],
            ) -> std::task::Poll<io::Result<usize>> {
                std::task::Poll::Ready(Err(io::Error::other("disk full")))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(b"hellonext").await.unwrap();
        drop(writer);

        let err = recv_payload_into(&mut reader, &mut BrokenSink, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, DfsError::Storage(_)));

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "next");
    }
}
