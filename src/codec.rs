//! # Line Codec
//!
//! The wire format shared by the handshake and the transfer protocols: UTF-8
//! text lines terminated by `\n`, an armored key block closed by a sentinel
//! line, and a payload line carrying base64.
//!
//! Every read is bounded in bytes, and optionally in time, so a misbehaving
//! peer can not make a session buffer without limit.
//!
//! The format has no escaping. A key block that happens to contain the
//! sentinel text is cut short at that line, and a `|` inside a file name
//! breaks the metadata split. Both are accepted limitations of the format.

use std::future::Future;
use std::io;
use std::time::Duration;

use base64::{engine::general_purpose, Engine};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::error::{Result, ShareError};

/// A buffered, half-duplex line channel over one stream.
///
/// The handshake and the transfer must share one `LineChannel`: bytes the
/// peer sent early may already sit in its read buffer.
pub struct LineChannel<S> {
    stream: BufStream<S>,
    read_timeout: Option<Duration>,
}

impl<S> LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Option<Duration>) -> Self {
        LineChannel {
            stream: BufStream::new(stream),
            read_timeout,
        }
    }

    /// Read one line of at most `max_bytes` (terminator excluded) and return
    /// it without its `\n` or `\r\n`.
    pub async fn read_line(&mut self, max_bytes: usize) -> Result<String> {
        let mut buf = Vec::new();
        let limit = max_bytes as u64 + 1;
        let read = bounded(
            self.read_timeout,
            (&mut self.stream).take(limit).read_until(b'\n', &mut buf),
        )
        .await?;

        if read == 0 {
            return Err(ShareError::ConnectionClosed);
        }
        if buf.last() != Some(&b'\n') {
            if read as u64 >= limit {
                return Err(ShareError::ProtocolViolation(format!(
                    "line exceeds {} bytes",
                    max_bytes
                )));
            }
            // EOF in the middle of a line
            return Err(ShareError::ConnectionClosed);
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        String::from_utf8(buf)
            .map_err(|_| ShareError::ProtocolViolation("line is not valid UTF-8".into()))
    }

    /// Accumulate lines until one contains `sentinel`. Returned text keeps
    /// each line's `\n`; the sentinel line itself is dropped.
    pub async fn read_until_sentinel(
        &mut self,
        sentinel: &str,
        max_line_bytes: usize,
        max_total_bytes: usize,
    ) -> Result<String> {
        let mut block = String::new();
        loop {
            let line = self.read_line(max_line_bytes).await?;
            if line.contains(sentinel) {
                debug!("Sentinel reached after {} bytes", block.len());
                return Ok(block);
            }

            if block.len() + line.len() + 1 > max_total_bytes {
                return Err(ShareError::ProtocolViolation(format!(
                    "block exceeds {} bytes without sentinel",
                    max_total_bytes
                )));
            }
            block.push_str(&line);
            block.push('\n');
        }
    }

    /// Write `line` plus a terminator and flush, so the peer sees it now.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a multi-line text block followed by the sentinel on its own line.
    pub async fn write_block(&mut self, block: &str, sentinel: &str) -> Result<()> {
        self.stream.write_all(block.as_bytes()).await?;
        if !block.is_empty() && !block.ends_with('\n') {
            self.stream.write_all(b"\n").await?;
        }
        self.write_line(sentinel).await
    }

    /// Flush and shut down the write side, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn bounded<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ShareError::Timeout(limit))?
            .map_err(ShareError::from),
        None => fut.await.map_err(ShareError::from),
    }
}

/// Text-safe encoding of an encrypted payload, as one line.
pub fn encode_payload(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_payload(line: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(line.trim())
        .map_err(|e| ShareError::ProtocolViolation(format!("payload is not valid base64: {}", e)))
}

/// Length of the padded base64 text for `raw_len` bytes.
pub fn encoded_len(raw_len: u64) -> u64 {
    raw_len.div_ceil(3) * 4
}
