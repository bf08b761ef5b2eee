use std::path::PathBuf;
use std::time::Duration;

use crate::{MAX_KEY_BLOCK_BYTES, MAX_LINE_BYTES, MAX_PAYLOAD_BYTES};

/// Tunables shared by the handshake and transfer protocols of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cap for ordinary protocol lines (label, fingerprint, responses, metadata)
    pub max_line_bytes: usize,
    /// Cap for the accumulated armored key block, sentinel excluded
    pub max_key_block_bytes: usize,
    /// Largest ciphertext a receiver will agree to take
    pub max_payload_bytes: u64,
    /// Bound on every blocking read. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Where received files land
    pub output_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_line_bytes: MAX_LINE_BYTES,
            max_key_block_bytes: MAX_KEY_BLOCK_BYTES,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            read_timeout: None,
            output_dir: PathBuf::from("."),
        }
    }
}

impl SessionConfig {
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// How to reach the local GnuPG installation.
#[derive(Debug, Clone)]
pub struct GpgConfig {
    pub program: PathBuf,
    /// Passed as `--homedir` when set; otherwise gpg picks its own default
    pub homedir: Option<PathBuf>,
}

impl Default for GpgConfig {
    fn default() -> Self {
        GpgConfig {
            program: PathBuf::from("gpg"),
            homedir: None,
        }
    }
}
