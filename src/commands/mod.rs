//! # Commands Module
//!
//! The two command handlers for secretshare:
//!
//! ## `host`
//! Offers one file to anyone who proves a GPG identity:
//! - Binds a TCP listener and prints the share address
//! - Spawns one session task per incoming connection
//! - Verifies the client's key, asks the operator, then encrypts to that key
//!
//! ## `connect`
//! Fetches the file from a host:
//! - Presents the local GPG identity
//! - Asks before downloading, then decrypts into the output directory
//!
//! Both show `indicatif` spinners (see [`progress`]) while waiting on the
//! peer and while gpg encrypts or decrypts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GpgConfig;
use crate::consent::{ConsentGate, StaticConsent, TerminalConsent};
use crate::session::Collaborators;

pub mod connect;
pub mod host;
pub mod progress;

/// Settings common to both commands, filled in from the global CLI flags.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub gpg: GpgConfig,
    pub read_timeout: Option<Duration>,
    /// Answer yes to every prompt
    pub assume_yes: bool,
}

impl CommandOptions {
    pub fn new(
        program: Option<PathBuf>,
        homedir: Option<PathBuf>,
        timeout_secs: Option<u64>,
        assume_yes: bool,
    ) -> Self {
        let mut gpg = GpgConfig::default();
        if let Some(program) = program {
            gpg.program = program;
        }
        gpg.homedir = homedir;

        CommandOptions {
            gpg,
            read_timeout: timeout_secs.map(Duration::from_secs),
            assume_yes,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let consent: Arc<dyn ConsentGate> = if self.assume_yes {
            Arc::new(StaticConsent(true))
        } else {
            Arc::new(TerminalConsent::new())
        };
        Collaborators::gpg(self.gpg.clone(), consent)
    }
}
