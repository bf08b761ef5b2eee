//! # Encrypted File Transfer
//!
//! Runs after an accepted handshake, on the same [`LineChannel`]. The host
//! encrypts one file to the client's verified fingerprint, advertises it, and
//! sends it only if the client's operator agrees.
//!
//! ```text
//! host -> client   <fileName>|<plainSize>|<cipherSize>\n
//! client -> host   ACCEPT\n | REJECT\n
//! host -> client   <base64 of ciphertext>\n        (only after ACCEPT)
//! ```
//!
//! There are no retries: any failure ends the session, and the file has to be
//! offered again on a fresh stream.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::Cipher;
use crate::codec::{decode_payload, encode_payload, encoded_len, LineChannel};
use crate::config::SessionConfig;
use crate::consent::{ask_blocking, format_file_size, ConsentGate, Prompt};
use crate::error::{Result, ShareError};
use crate::{TRANSFER_ACCEPT, TRANSFER_REJECT};

const FIELD_SEPARATOR: char = '|';

/// What the sender advertises before any ciphertext moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub file_name: String,
    pub plain_size: u64,
    pub cipher_size: u64,
}

impl TransferMetadata {
    /// Parse a metadata line. Exactly three `|`-separated fields, sizes
    /// unsigned decimal digits with no sign or padding.
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(ShareError::ProtocolViolation(format!(
                "metadata has {} fields, expected 3",
                fields.len()
            )));
        }

        let file_name = fields[0].to_string();
        if file_name.is_empty() {
            return Err(ShareError::ProtocolViolation("metadata has an empty file name".into()));
        }
        let plain_size = parse_size("plain size", fields[1])?;
        let cipher_size = parse_size("cipher size", fields[2])?;

        Ok(TransferMetadata {
            file_name,
            plain_size,
            cipher_size,
        })
    }

    /// The file name as a single path component, safe to join under a
    /// local directory.
    pub fn local_file_name(&self) -> Result<String> {
        safe_file_name(&self.file_name)
    }
}

impl fmt::Display for TransferMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.file_name,
            self.plain_size,
            self.cipher_size,
            sep = FIELD_SEPARATOR
        )
    }
}

impl FromStr for TransferMetadata {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self> {
        TransferMetadata::parse(s)
    }
}

/// Plain ASCII digits only: no sign, no padding.
fn parse_size(what: &str, field: &str) -> Result<u64> {
    let invalid = || ShareError::ProtocolViolation(format!("invalid {}: {:?}", what, field));
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    field.parse::<u64>().map_err(|_| invalid())
}

/// Reduce a reported name to its last path component, treating both `/` and
/// `\` as separators whatever the local platform.
pub fn safe_file_name(reported: &str) -> Result<String> {
    let base = reported
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(ShareError::ProtocolViolation(format!(
            "unusable file name {:?}",
            reported
        )));
    }
    Ok(base.to_string())
}

/// Names the wire format can carry unambiguously.
fn check_wire_safe(name: &str) -> Result<()> {
    if name.contains(|c: char| c == FIELD_SEPARATOR || c == '\n' || c == '\r') {
        return Err(ShareError::ProtocolViolation(format!(
            "file name {:?} can not be sent: it contains '|' or a line break",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Declined,
    Failed,
}

impl TransferOutcome {
    fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => TransferOutcome::Completed,
            Err(ShareError::TransferDeclined) => TransferOutcome::Declined,
            Err(_) => TransferOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Stat,
    Encrypt,
    SendMetadata,
    AwaitConsent,
    SendPayload,
    Done(TransferOutcome),
}

/// The host side of the transfer.
#[derive(Debug)]
pub struct TransferSender {
    state: SenderState,
    visited: Vec<SenderState>,
}

impl Default for TransferSender {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSender {
    pub fn new() -> Self {
        TransferSender {
            state: SenderState::Stat,
            visited: vec![SenderState::Stat],
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn visited(&self) -> &[SenderState] {
        &self.visited
    }

    fn enter(&mut self, next: SenderState) {
        debug!("sender: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.visited.push(next);
    }

    /// Offer `source` to the peer, encrypted for `recipient_fingerprint`.
    pub async fn run<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        source: &Path,
        recipient_fingerprint: &str,
        cipher: &dyn Cipher,
        config: &SessionConfig,
    ) -> Result<TransferMetadata>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self
            .drive(channel, source, recipient_fingerprint, cipher, config)
            .await;
        self.enter(SenderState::Done(TransferOutcome::of(&result)));
        result
    }

    async fn drive<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        source: &Path,
        recipient_fingerprint: &str,
        cipher: &dyn Cipher,
        config: &SessionConfig,
    ) -> Result<TransferMetadata>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (file_name, plain_size) = stat_source(source).await?;
        check_wire_safe(&file_name)?;
        info!("Preparing to send file: {} ({})", file_name, format_file_size(plain_size));

        self.enter(SenderState::Encrypt);
        let ciphertext = cipher
            .encrypt(source, recipient_fingerprint)
            .await
            .map_err(|e| {
                if matches!(e, ShareError::EncryptionFailed(_) | ShareError::FileUnavailable { .. }) {
                    e
                } else {
                    ShareError::EncryptionFailed(e.to_string())
                }
            })?;
        let metadata = TransferMetadata {
            file_name,
            plain_size,
            cipher_size: ciphertext.len() as u64,
        };
        debug!("Encrypted file size: {}", format_file_size(metadata.cipher_size));

        self.enter(SenderState::SendMetadata);
        channel.write_line(&metadata.to_string()).await?;

        self.enter(SenderState::AwaitConsent);
        let response = match channel.read_line(config.max_line_bytes).await {
            Ok(line) => line,
            Err(e) => {
                warn!("No answer to file offer: {}", e);
                return Err(ShareError::TransferDeclined);
            }
        };
        if response.trim() != TRANSFER_ACCEPT {
            info!("Client rejected the file transfer");
            return Err(ShareError::TransferDeclined);
        }

        self.enter(SenderState::SendPayload);
        info!("Client accepted, sending encrypted file...");
        channel.write_line(&encode_payload(&ciphertext)).await?;

        info!("File sent successfully");
        Ok(metadata)
    }
}

async fn stat_source(source: &Path) -> Result<(String, u64)> {
    let unavailable = |source_err: io::Error| ShareError::FileUnavailable {
        path: source.to_path_buf(),
        source: source_err,
    };

    let meta = tokio::fs::metadata(source).await.map_err(unavailable)?;
    if !meta.is_file() {
        return Err(unavailable(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| unavailable(io::Error::new(io::ErrorKind::InvalidInput, "no file name")))?;

    Ok((file_name, meta.len()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    AwaitMetadata,
    Parse,
    AwaitHumanConsent,
    SendAccept,
    SendReject,
    AwaitPayload,
    Decode,
    Decrypt,
    Done(TransferOutcome),
}

/// A file that made it to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: TransferMetadata,
    pub path: PathBuf,
}

/// The client side of the transfer.
#[derive(Debug)]
pub struct TransferReceiver {
    state: ReceiverState,
    visited: Vec<ReceiverState>,
}

impl Default for TransferReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferReceiver {
    pub fn new() -> Self {
        TransferReceiver {
            state: ReceiverState::AwaitMetadata,
            visited: vec![ReceiverState::AwaitMetadata],
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn visited(&self) -> &[ReceiverState] {
        &self.visited
    }

    fn enter(&mut self, next: ReceiverState) {
        debug!("receiver: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.visited.push(next);
    }

    /// Take the offered file into `config.output_dir`, if the operator agrees.
    pub async fn run<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        cipher: &dyn Cipher,
        consent: &dyn ConsentGate,
        config: &SessionConfig,
    ) -> Result<ReceivedFile>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.drive(channel, cipher, consent, config).await;
        self.enter(ReceiverState::Done(TransferOutcome::of(&result)));
        result
    }

    async fn drive<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        cipher: &dyn Cipher,
        consent: &dyn ConsentGate,
        config: &SessionConfig,
    ) -> Result<ReceivedFile>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let line = channel.read_line(config.max_line_bytes).await?;

        self.enter(ReceiverState::Parse);
        let metadata = TransferMetadata::parse(&line)?;
        let local_name = metadata.local_file_name()?;
        if metadata.cipher_size > config.max_payload_bytes {
            return Err(ShareError::ProtocolViolation(format!(
                "offered payload of {} exceeds the {} limit",
                format_file_size(metadata.cipher_size),
                format_file_size(config.max_payload_bytes)
            )));
        }
        debug!("Offered {:?} as {:?}", metadata, local_name);

        self.enter(ReceiverState::AwaitHumanConsent);
        let prompt = Prompt::File {
            name: local_name.clone(),
            size: metadata.plain_size,
        };
        let accepted = ask_blocking(consent, &prompt);

        if !accepted {
            self.enter(ReceiverState::SendReject);
            channel.write_line(TRANSFER_REJECT).await?;
            info!("File transfer rejected by user");
            return Err(ShareError::TransferDeclined);
        }

        self.enter(ReceiverState::SendAccept);
        channel.write_line(TRANSFER_ACCEPT).await?;

        self.enter(ReceiverState::AwaitPayload);
        info!("Receiving encrypted file...");
        let max_line = usize::try_from(encoded_len(metadata.cipher_size))
            .map_err(|_| ShareError::ProtocolViolation("payload too large for this platform".into()))?;
        let encoded = channel.read_line(max_line).await?;

        self.enter(ReceiverState::Decode);
        let ciphertext = decode_payload(&encoded)?;
        if ciphertext.len() as u64 != metadata.cipher_size {
            return Err(ShareError::ProtocolViolation(format!(
                "received {} bytes of ciphertext, {} were announced",
                ciphertext.len(),
                metadata.cipher_size
            )));
        }

        self.enter(ReceiverState::Decrypt);
        info!(
            "Received {} of encrypted data, decrypting...",
            format_file_size(ciphertext.len() as u64)
        );
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| ShareError::DecryptionFailed(format!("cannot create output directory: {}", e)))?;
        let path = config.output_dir.join(&local_name);
        cipher.decrypt(&ciphertext, &path).await.map_err(|e| {
            if matches!(e, ShareError::DecryptionFailed(_)) {
                e
            } else {
                ShareError::DecryptionFailed(e.to_string())
            }
        })?;

        info!("File saved successfully to: {}", path.display());
        Ok(ReceivedFile { metadata, path })
    }
}
