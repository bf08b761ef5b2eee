//! # Sessions
//!
//! One session is one stream: the handshake, then, only if it was accepted,
//! the transfer. Nothing is shared between sessions except the collaborators
//! (keyring, cipher, consent gate), which tolerate concurrent use.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::{Cipher, GpgCipher};
use crate::codec::LineChannel;
use crate::config::{GpgConfig, SessionConfig};
use crate::consent::ConsentGate;
use crate::error::{Result, ShareError};
use crate::handshake::{ClientHandshake, HostHandshake};
use crate::identity::{GpgKeyring, IdentityProvider};
use crate::transfer::{TransferMetadata, TransferReceiver, TransferSender};

/// The external capabilities a session needs.
#[derive(Clone)]
pub struct Collaborators {
    pub keyring: Arc<dyn IdentityProvider>,
    pub cipher: Arc<dyn Cipher>,
    pub consent: Arc<dyn ConsentGate>,
}

impl Collaborators {
    pub fn new(
        keyring: Arc<dyn IdentityProvider>,
        cipher: Arc<dyn Cipher>,
        consent: Arc<dyn ConsentGate>,
    ) -> Self {
        Collaborators {
            keyring,
            cipher,
            consent,
        }
    }

    /// GnuPG for keys and encryption, `consent` for the human.
    pub fn gpg(config: GpgConfig, consent: Arc<dyn ConsentGate>) -> Self {
        Collaborators {
            keyring: Arc::new(GpgKeyring::new(config.clone())),
            cipher: Arc::new(GpgCipher::new(config)),
            consent,
        }
    }
}

/// Observable milestones of a session, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    /// Handshake accepted
    Accepted,
    /// Handshake rejected, by a human or by verification
    Rejected,
    /// File delivered
    Done,
    /// File offer turned down
    Declined,
    /// Transfer aborted by an error
    Failed,
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStep::Accepted => "Accepted",
            SessionStep::Rejected => "Rejected",
            SessionStep::Done => "Done",
            SessionStep::Declined => "Declined",
            SessionStep::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct SessionReport {
    pub steps: Vec<SessionStep>,
    /// Host side only: the verified fingerprint of the client
    pub peer_fingerprint: Option<String>,
    pub metadata: Option<TransferMetadata>,
    /// Client side only: where the decrypted file was written
    pub saved_to: Option<PathBuf>,
    pub error: Option<ShareError>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.steps.last() == Some(&SessionStep::Done)
    }

    pub fn handshake_accepted(&self) -> bool {
        self.steps.first() == Some(&SessionStep::Accepted)
    }

    /// `Err` with the terminal error if the session did not complete.
    pub fn into_result(mut self) -> Result<SessionReport> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }

    fn transfer_finished<T>(&mut self, result: &Result<T>) {
        let step = match result {
            Ok(_) => SessionStep::Done,
            Err(ShareError::TransferDeclined) => SessionStep::Declined,
            Err(_) => SessionStep::Failed,
        };
        self.steps.push(step);
    }
}

/// Serve `file` to whoever is on the other end of `stream`.
pub async fn host_session<S>(
    stream: S,
    file: &Path,
    deps: &Collaborators,
    config: &SessionConfig,
) -> SessionReport
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut report = SessionReport::default();
    let mut channel = LineChannel::new(stream, config.read_timeout);

    let mut handshake = HostHandshake::new();
    handshake
        .run(&mut channel, deps.keyring.as_ref(), deps.consent.as_ref(), config)
        .await;
    let session = handshake.into_session();

    if !session.is_accepted() {
        report.steps.push(SessionStep::Rejected);
        report.error = session.into_failure();
        return report;
    }
    report.steps.push(SessionStep::Accepted);

    let fingerprint = match session.peer_fingerprint() {
        Some(fpr) => fpr.to_string(),
        None => {
            report.steps.push(SessionStep::Failed);
            report.error = Some(ShareError::VerificationFailed(
                "no verified client fingerprint".into(),
            ));
            return report;
        }
    };
    report.peer_fingerprint = Some(fingerprint.clone());

    let mut sender = TransferSender::new();
    let result = sender
        .run(&mut channel, file, &fingerprint, deps.cipher.as_ref(), config)
        .await;
    report.transfer_finished(&result);

    match result {
        Ok(metadata) => {
            report.metadata = Some(metadata);
            if let Err(e) = channel.shutdown().await {
                debug!("Shutdown after transfer failed: {}", e);
            }
            info!("File transfer completed successfully");
        }
        Err(e) => report.error = Some(e),
    }
    report
}

/// Present our identity over `stream` and take the file on offer.
pub async fn client_session<S>(
    stream: S,
    deps: &Collaborators,
    config: &SessionConfig,
) -> SessionReport
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut report = SessionReport::default();
    let mut channel = LineChannel::new(stream, config.read_timeout);

    let mut handshake = ClientHandshake::new();
    handshake
        .run(&mut channel, deps.keyring.as_ref(), config)
        .await;
    let session = handshake.into_session();

    if !session.is_accepted() {
        report.steps.push(SessionStep::Rejected);
        report.error = session.into_failure();
        return report;
    }
    report.steps.push(SessionStep::Accepted);

    let mut receiver = TransferReceiver::new();
    let result = receiver
        .run(&mut channel, deps.cipher.as_ref(), deps.consent.as_ref(), config)
        .await;
    report.transfer_finished(&result);

    match result {
        Ok(received) => {
            report.metadata = Some(received.metadata);
            report.saved_to = Some(received.path);
        }
        Err(e) => report.error = Some(e),
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{Prompt, ScriptedConsent, StaticConsent};
    use crate::test_support::{fake_identity, temp_path, FakeCipher, FakeKeyring};
    use std::fs;
    use std::time::{Duration, Instant};
    use tokio::io::duplex;

    const CLIENT_FPR: &str = "0DDBA11C0DDBA11C0DDBA11C0DDBA11C0DDBA11C";

    fn host_deps(consent: Arc<dyn ConsentGate>) -> Collaborators {
        Collaborators::new(
            Arc::new(FakeKeyring::empty()),
            Arc::new(FakeCipher::new("HOST")),
            consent,
        )
    }

    fn client_deps(consent: Arc<dyn ConsentGate>) -> Collaborators {
        Collaborators::new(
            Arc::new(FakeKeyring::with_identity(fake_identity("Bob", CLIENT_FPR))),
            Arc::new(FakeCipher::new(CLIENT_FPR)),
            consent,
        )
    }

    #[tokio::test]
    async fn test_full_session() {
        let dir = temp_path("session_full");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("plan.txt");
        fs::write(&file, b"meet at noon").unwrap();
        let out_dir = dir.join("downloads");
        let config = SessionConfig::default().with_output_dir(&out_dir);

        let (a, b) = duplex(64 * 1024);
        let host = host_deps(Arc::new(StaticConsent(true)));
        let client = client_deps(Arc::new(StaticConsent(true)));
        let (host_report, client_report) = tokio::join!(
            host_session(a, &file, &host, &config),
            client_session(b, &client, &config),
        );

        assert!(host_report.is_success(), "{:?}", host_report.error);
        assert!(client_report.is_success(), "{:?}", client_report.error);
        assert_eq!(host_report.steps, vec![SessionStep::Accepted, SessionStep::Done]);
        assert_eq!(host_report.peer_fingerprint.as_deref(), Some(CLIENT_FPR));
        assert_eq!(client_report.saved_to, Some(out_dir.join("plan.txt")));
        assert_eq!(fs::read(out_dir.join("plan.txt")).unwrap(), b"meet at noon");

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_rejected_handshake_skips_transfer() {
        let (a, b) = duplex(64 * 1024);
        let config = SessionConfig::default();
        let host = host_deps(Arc::new(StaticConsent(false)));
        let client_consent = Arc::new(ScriptedConsent::new([true]));
        let client = client_deps(client_consent.clone());

        let (host_report, client_report) = tokio::join!(
            host_session(a, Path::new("/never/read"), &host, &config),
            client_session(b, &client, &config),
        );

        assert_eq!(host_report.steps, vec![SessionStep::Rejected]);
        assert!(matches!(host_report.error, Some(ShareError::ConsentDeclined)));
        assert_eq!(client_report.steps, vec![SessionStep::Rejected]);
        assert!(matches!(
            client_report.error,
            Some(ShareError::HandshakeRejected(_))
        ));
        assert!(client_consent.asked().is_empty());
        assert!(client_report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_declined_file() {
        let dir = temp_path("session_declined");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("big.bin");
        fs::write(&file, vec![7u8; 4096]).unwrap();
        let config = SessionConfig::default().with_output_dir(dir.join("downloads"));

        let (a, b) = duplex(64 * 1024);
        let host = host_deps(Arc::new(StaticConsent(true)));
        let client = client_deps(Arc::new(StaticConsent(false)));
        let (host_report, client_report) = tokio::join!(
            host_session(a, &file, &host, &config),
            client_session(b, &client, &config),
        );

        assert_eq!(host_report.steps, vec![SessionStep::Accepted, SessionStep::Declined]);
        assert_eq!(client_report.steps, vec![SessionStep::Accepted, SessionStep::Declined]);
        assert!(matches!(client_report.error, Some(ShareError::TransferDeclined)));
        assert!(client_report.saved_to.is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    /// An operator who takes a while to answer yes.
    struct SlowConsent(Duration);

    impl ConsentGate for SlowConsent {
        fn ask(&self, _prompt: &Prompt) -> bool {
            std::thread::sleep(self.0);
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_open_prompt_does_not_stall_runtime() {
        let dir = temp_path("session_slow_prompt");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("memo.txt");
        fs::write(&file, b"slow hands").unwrap();
        let config = SessionConfig::default().with_output_dir(dir.join("downloads"));

        let (a, b) = duplex(64 * 1024);
        let host = host_deps(Arc::new(SlowConsent(Duration::from_millis(600))));
        let client = client_deps(Arc::new(StaticConsent(true)));

        let started = Instant::now();
        let host_task = {
            let (file, config) = (file.clone(), config.clone());
            tokio::spawn(async move { host_session(a, &file, &host, &config).await })
        };
        let client_task = {
            let config = config.clone();
            tokio::spawn(async move { client_session(b, &client, &config).await })
        };
        let ticker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            started.elapsed()
        });

        let ticked_after = ticker.await.unwrap();
        assert!(
            ticked_after < Duration::from_millis(300),
            "timer fired after {:?} while the prompt was open",
            ticked_after
        );

        let host_report = host_task.await.unwrap();
        let client_report = client_task.await.unwrap();
        assert!(host_report.is_success(), "{:?}", host_report.error);
        assert!(client_report.is_success(), "{:?}", client_report.error);
        assert!(started.elapsed() >= Duration::from_millis(600));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_report_result() {
        let report = SessionReport {
            steps: vec![SessionStep::Accepted, SessionStep::Done],
            ..Default::default()
        };
        assert!(report.is_success());
        assert!(report.handshake_accepted());
        assert!(report.into_result().is_ok());

        assert_eq!(SessionStep::Declined.to_string(), "Declined");
    }
}
