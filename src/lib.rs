pub mod error;
pub mod config;
pub mod codec;
pub mod identity;
pub mod cipher;
pub mod consent;
pub mod handshake;
pub mod transfer;
pub mod session;
pub mod networking;
pub mod commands;

pub use error::{Result, ShareError};

pub const APP_NAME: &str = "secretshare";
pub const APP_VERSION: &str = "1.0.0";

/// Terminates the armored public key block sent by the client.
pub const END_PUBLIC_KEY: &str = "<<<END_PUBLIC_KEY>>>";

pub const HANDSHAKE_ACCEPTED: &str = "ACCEPTED";
pub const HANDSHAKE_REJECTED: &str = "REJECTED";
pub const TRANSFER_ACCEPT: &str = "ACCEPT";
pub const TRANSFER_REJECT: &str = "REJECT";

pub const DEFAULT_PORT: u16 = 0;
pub const MAX_LINE_BYTES: usize = 4 * 1024;
pub const MAX_KEY_BLOCK_BYTES: usize = 64 * 1024;
pub const MAX_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;

#[cfg(test)]
pub(crate) mod test_support;
