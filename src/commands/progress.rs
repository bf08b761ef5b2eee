//! Terminal spinners for the CLI.
//!
//! The sessions themselves know nothing about the terminal. The commands wrap
//! the session collaborators so that encryption, decryption and the waits in
//! between show a spinner, and so that spinners get out of the way while the
//! operator answers a prompt.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::cipher::Cipher;
use crate::consent::{format_file_size, ConsentGate, Prompt};
use crate::error::Result;
use crate::session::Collaborators;

#[derive(Clone)]
pub struct Spinners {
    mp: MultiProgress,
    visible: bool,
    // The single "waiting for ..." line, replaced as the session moves on
    status: Arc<Mutex<Option<ProgressBar>>>,
    // Open prompts; spinners stay hidden while any is open
    prompting: Arc<Mutex<usize>>,
}

impl Default for Spinners {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinners {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr(), true)
    }

    /// Spinners that never draw.
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden(), false)
    }

    fn with_target(target: ProgressDrawTarget, visible: bool) -> Self {
        Spinners {
            mp: MultiProgress::with_draw_target(target),
            visible,
            status: Arc::new(Mutex::new(None)),
            prompting: Arc::new(Mutex::new(0)),
        }
    }

    /// A new ticking spinner for one piece of work.
    pub fn start(&self, message: impl Into<String>) -> ProgressBar {
        let pb = self.mp.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(message.into());
        pb
    }

    /// Show what we are waiting on, replacing the previous wait.
    pub fn wait_for(&self, message: impl Into<String>) {
        let pb = self.start(message);
        if let Ok(mut status) = self.status.lock() {
            if let Some(previous) = status.replace(pb) {
                previous.finish_and_clear();
            }
        }
    }

    pub fn stop_waiting(&self) {
        if let Ok(mut status) = self.status.lock() {
            if let Some(previous) = status.take() {
                previous.finish_and_clear();
            }
        }
    }

    pub fn waiting_on(&self) -> Option<String> {
        let status = self.status.lock().ok()?;
        status.as_ref().map(|pb| pb.message())
    }

    /// Print a line above the spinners.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.visible {
            let _ = self.mp.println(line);
        } else {
            println!("{}", line.as_ref());
        }
    }

    fn prompt_opened(&self) {
        if let Ok(mut open) = self.prompting.lock() {
            if *open == 0 {
                let _ = self.mp.clear();
                self.mp.set_draw_target(ProgressDrawTarget::hidden());
            }
            *open += 1;
        }
    }

    fn prompt_closed(&self) {
        if let Ok(mut open) = self.prompting.lock() {
            *open = open.saturating_sub(1);
            if *open == 0 && self.visible {
                self.mp.set_draw_target(ProgressDrawTarget::stderr());
            }
        }
    }

    /// Wrap the cipher and consent gate of `deps` with spinners. After the
    /// operator says yes, `then_wait_for` becomes the waiting message.
    pub fn decorate(&self, deps: Collaborators, then_wait_for: Option<&str>) -> Collaborators {
        Collaborators {
            keyring: deps.keyring,
            cipher: Arc::new(SpinnerCipher {
                inner: deps.cipher,
                spinners: self.clone(),
            }),
            consent: Arc::new(SpinnerConsent {
                inner: deps.consent,
                spinners: self.clone(),
                then_wait_for: then_wait_for.map(str::to_string),
            }),
        }
    }
}

/// Hides the spinners while the operator is asked.
pub struct SpinnerConsent {
    inner: Arc<dyn ConsentGate>,
    spinners: Spinners,
    then_wait_for: Option<String>,
}

impl ConsentGate for SpinnerConsent {
    fn ask(&self, prompt: &Prompt) -> bool {
        self.spinners.prompt_opened();
        let answer = self.inner.ask(prompt);
        self.spinners.prompt_closed();

        if let Some(next) = &self.then_wait_for {
            if answer {
                self.spinners.wait_for(next.clone());
            } else {
                self.spinners.stop_waiting();
            }
        }
        answer
    }
}

/// Shows a spinner for the duration of each gpg call.
pub struct SpinnerCipher {
    inner: Arc<dyn Cipher>,
    spinners: Spinners,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// Long key id: the last 16 hex digits
fn short_id(fingerprint: &str) -> &str {
    fingerprint
        .get(fingerprint.len().saturating_sub(16)..)
        .unwrap_or(fingerprint)
}

#[async_trait]
impl Cipher for SpinnerCipher {
    async fn encrypt(&self, source: &Path, recipient_fingerprint: &str) -> Result<Vec<u8>> {
        let name = display_name(source);
        let pb = self.spinners.start(format!(
            "Encrypting {} for {}",
            name,
            short_id(recipient_fingerprint)
        ));

        let result = self.inner.encrypt(source, recipient_fingerprint).await;
        match &result {
            Ok(ciphertext) => pb.finish_with_message(format!(
                "Encrypted {} ({})",
                name,
                format_file_size(ciphertext.len() as u64)
            )),
            Err(_) => pb.abandon_with_message(format!("Could not encrypt {}", name)),
        }
        result
    }

    async fn decrypt(&self, ciphertext: &[u8], destination: &Path) -> Result<()> {
        self.spinners.stop_waiting();
        let name = display_name(destination);
        let pb = self.spinners.start(format!("Decrypting {}", name));

        let result = self.inner.decrypt(ciphertext, destination).await;
        match &result {
            Ok(()) => pb.finish_with_message(format!("Decrypted {}", name)),
            Err(_) => pb.abandon_with_message(format!("Could not decrypt {}", name)),
        }
        result
    }
}
