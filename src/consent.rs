//! # Consent Gate
//!
//! The human-in-the-loop decision points. Both protocols receive a
//! [`ConsentGate`] instead of touching the terminal, so scripted answers can
//! stand in for a person.
//!
//! Every implementation fails closed: if an answer can not be obtained, the
//! answer is no.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use log::{debug, warn};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;

/// What the operator is being asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// A verified remote identity wants to connect
    Identity { label: String },
    /// The remote offers a file
    File { name: String, size: u64 },
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Identity { label } => write!(f, "Incoming connection from GPG user: {}", label),
            Prompt::File { name, size } => {
                write!(f, "Incoming file: {} ({})", name, format_file_size(*size))
            }
        }
    }
}

impl Prompt {
    fn question(&self) -> &'static str {
        match self {
            Prompt::Identity { .. } => "Accept connection? (y/N): ",
            Prompt::File { .. } => "Download this file? (y/N): ",
        }
    }
}

/// A synchronous yes/no decision. Blocking is allowed.
pub trait ConsentGate: Send + Sync {
    fn ask(&self, prompt: &Prompt) -> bool;
}

/// Ask `gate` from async code. On a multi-threaded runtime the worker is
/// handed off for the duration of the call, so a slow human never stalls
/// other sessions, the accept loop or read timeouts.
pub fn ask_blocking(gate: &dyn ConsentGate, prompt: &Prompt) -> bool {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            task::block_in_place(|| gate.ask(prompt))
        }
        _ => gate.ask(prompt),
    }
}

/// Asks on stdout and reads the answer from stdin.
#[derive(Debug, Default)]
pub struct TerminalConsent {
    // Concurrent sessions must not interleave their questions
    lock: Mutex<()>,
}

impl TerminalConsent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsentGate for TerminalConsent {
    fn ask(&self, prompt: &Prompt) -> bool {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        ask_on(prompt, &mut input, &mut output)
    }
}

/// Ask `prompt` on `output` and read one answer line from `input`.
pub fn ask_on<R: BufRead, W: Write>(prompt: &Prompt, input: &mut R, output: &mut W) -> bool {
    if write!(output, "\n{}\n{}", prompt, prompt.question())
        .and_then(|_| output.flush())
        .is_err()
    {
        warn!("Failed to write consent prompt");
        return false;
    }

    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(0) => {
            debug!("No answer on stdin, declining");
            false
        }
        Ok(_) => is_yes(&answer),
        Err(e) => {
            warn!("Failed to read user input: {}", e);
            false
        }
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Gives the same answer to every prompt. `StaticConsent(true)` backs `--yes`.
#[derive(Debug, Clone, Copy)]
pub struct StaticConsent(pub bool);

impl ConsentGate for StaticConsent {
    fn ask(&self, prompt: &Prompt) -> bool {
        debug!("{} -> {}", prompt, if self.0 { "yes" } else { "no" });
        self.0
    }
}

/// Replays a fixed list of answers in order, recording every prompt it saw.
/// Once the script runs out it answers no.
#[derive(Debug, Default)]
pub struct ScriptedConsent {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<Prompt>>,
}

impl ScriptedConsent {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        ScriptedConsent {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<Prompt> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl ConsentGate for ScriptedConsent {
    fn ask(&self, prompt: &Prompt) -> bool {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(prompt.clone());
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front())
            .unwrap_or(false)
    }
}

/// Binary-unit size with one decimal, e.g. `1536 -> "1.5 KB"`.
pub fn format_file_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    const SUFFIXES: &[u8] = b"KMGTPE";

    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, SUFFIXES[exp] as char)
}
