//! # Session Error Types
//!
//! Every variant is terminal for the session that produced it. Nothing in the
//! handshake or transfer protocols retries; the surrounding layer closes or
//! resets the stream and logs the error.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShareError {
    /// No local secret key to identify ourselves with
    #[error("No local identity available: {0}")]
    IdentityUnavailable(String),

    /// Malformed or unexpected wire data
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Failed to import remote public key: {0}")]
    ImportFailed(String),

    /// The claimed fingerprint does not belong to the key that was supplied
    #[error("Fingerprint verification failed: {0}")]
    VerificationFailed(String),

    /// The local operator said no
    #[error("Consent declined by local operator")]
    ConsentDeclined,

    /// The remote host answered the handshake with anything but ACCEPTED
    #[error("Handshake rejected by host: {0}")]
    HandshakeRejected(String),

    #[error("File unavailable: {path}: {source}")]
    FileUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The file offer was turned down, by either side
    #[error("File transfer declined")]
    TransferDeclined,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stream IO error: {0}")]
    StreamIO(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ShareError>;

impl ShareError {
    /// True when the failure came from the transport itself. The peer may be
    /// gone or stalled, so nothing further should be written to it.
    pub fn is_stream_failure(&self) -> bool {
        matches!(
            self,
            ShareError::StreamIO(_) | ShareError::ConnectionClosed | ShareError::Timeout(_)
        )
    }

    /// True for the outcomes a human caused, as opposed to faults.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            ShareError::ConsentDeclined
                | ShareError::HandshakeRejected(_)
                | ShareError::TransferDeclined
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_failures() {
        let io_err = ShareError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io_err.is_stream_failure());
        assert!(ShareError::ConnectionClosed.is_stream_failure());
        assert!(ShareError::Timeout(Duration::from_secs(1)).is_stream_failure());

        assert!(!ShareError::ProtocolViolation("bad".into()).is_stream_failure());
        assert!(!ShareError::ImportFailed("bad".into()).is_stream_failure());
    }

    #[test]
    fn test_refusals_are_distinct_from_faults() {
        assert!(ShareError::ConsentDeclined.is_refusal());
        assert!(ShareError::TransferDeclined.is_refusal());
        assert!(ShareError::HandshakeRejected("REJECTED".into()).is_refusal());
        assert!(!ShareError::EncryptionFailed("gpg".into()).is_refusal());
    }

    #[test]
    fn test_display_mentions_path() {
        let err = ShareError::FileUnavailable {
            path: PathBuf::from("/nope/secret.txt"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/nope/secret.txt"));
    }
}
