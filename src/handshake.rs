//! # Trust Handshake
//!
//! Runs once per stream, before any file data moves. The client presents its
//! OpenPGP identity; the host imports the key, checks that the claimed
//! fingerprint really belongs to it, and only then asks its operator whether
//! to accept.
//!
//! ```text
//! client -> host   <label>\n
//! client -> host   <fingerprint>\n
//! client -> host   <armored public key lines...>
//! client -> host   <<<END_PUBLIC_KEY>>>\n
//! host -> client   ACCEPTED\n | REJECTED\n
//! ```
//!
//! Each role is its own state machine ([`HostHandshake`], [`ClientHandshake`]),
//! picked once through [`Handshake::for_role`]. A session is one-shot: every
//! failure collapses the outcome to [`Outcome::Rejected`] and nothing is retried.

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::LineChannel;
use crate::config::SessionConfig;
use crate::consent::{ask_blocking, ConsentGate, Prompt};
use crate::error::{Result, ShareError};
use crate::identity::IdentityProvider;
use crate::{END_PUBLIC_KEY, HANDSHAKE_ACCEPTED, HANDSHAKE_REJECTED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Accepted,
    Rejected,
}

/// The result of one handshake, owned by the stream it ran on.
#[derive(Debug)]
pub struct HandshakeSession {
    role: Role,
    peer_fingerprint: Option<String>,
    outcome: Outcome,
    failure: Option<ShareError>,
}

impl HandshakeSession {
    fn new(role: Role) -> Self {
        HandshakeSession {
            role,
            peer_fingerprint: None,
            outcome: Outcome::Pending,
            failure: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// On the host: the client's fingerprint, set once it has been verified
    /// against the imported key.
    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_fingerprint.as_deref()
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == Outcome::Accepted
    }

    /// Why the handshake was rejected, if it was.
    pub fn failure(&self) -> Option<&ShareError> {
        self.failure.as_ref()
    }

    pub fn into_failure(self) -> Option<ShareError> {
        self.failure
    }

    fn finish(&mut self, result: Result<()>) -> Outcome {
        match result {
            Ok(()) => self.outcome = Outcome::Accepted,
            Err(e) => {
                self.outcome = Outcome::Rejected;
                self.failure = Some(e);
            }
        }
        self.outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    WaitLabel,
    WaitFingerprint,
    WaitKeyBlock,
    Importing,
    Verifying,
    AwaitingConsent,
    Responding,
    Done(Outcome),
}

/// The verifying side.
#[derive(Debug)]
pub struct HostHandshake {
    state: HostState,
    visited: Vec<HostState>,
    session: HandshakeSession,
}

impl Default for HostHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl HostHandshake {
    pub fn new() -> Self {
        HostHandshake {
            state: HostState::WaitLabel,
            visited: vec![HostState::WaitLabel],
            session: HandshakeSession::new(Role::Host),
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn visited(&self) -> &[HostState] {
        &self.visited
    }

    pub fn session(&self) -> &HandshakeSession {
        &self.session
    }

    pub fn into_session(self) -> HandshakeSession {
        self.session
    }

    fn enter(&mut self, next: HostState) {
        debug!("host handshake: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.visited.push(next);
    }

    pub async fn run<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        keyring: &dyn IdentityProvider,
        consent: &dyn ConsentGate,
        config: &SessionConfig,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.drive(channel, keyring, consent, config).await;

        if let Err(e) = &result {
            warn!("Handshake failed in {:?}: {}", self.state, e);
            // Only once the whole key block has been read is the client
            // waiting on us, so only then is a REJECTED line owed.
            let client_waiting = matches!(
                self.state,
                HostState::Importing | HostState::Verifying | HostState::AwaitingConsent
            );
            if client_waiting && !e.is_stream_failure() {
                if let Err(write_err) = channel.write_line(HANDSHAKE_REJECTED).await {
                    debug!("Could not send courtesy rejection: {}", write_err);
                }
            }
        }

        let outcome = self.session.finish(result);
        self.enter(HostState::Done(outcome));
        outcome
    }

    async fn drive<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        keyring: &dyn IdentityProvider,
        consent: &dyn ConsentGate,
        config: &SessionConfig,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let label = channel.read_line(config.max_line_bytes).await?;
        let label = label.trim().to_string();
        if label.is_empty() {
            return Err(ShareError::ProtocolViolation("client sent an empty label".into()));
        }

        self.enter(HostState::WaitFingerprint);
        let fingerprint = channel.read_line(config.max_line_bytes).await?;
        let fingerprint = fingerprint.trim().to_string();
        if fingerprint.is_empty() {
            return Err(ShareError::ProtocolViolation(
                "client sent an empty fingerprint".into(),
            ));
        }

        self.enter(HostState::WaitKeyBlock);
        let armor = channel
            .read_until_sentinel(END_PUBLIC_KEY, config.max_line_bytes, config.max_key_block_bytes)
            .await?;
        debug!(
            "Received public key block: {} bytes, starting {:?}",
            armor.len(),
            armor.lines().next().unwrap_or_default()
        );

        self.enter(HostState::Importing);
        info!("Importing public key of {} ({})", label, fingerprint);
        let imported = keyring.import_public_key(&armor).await.map_err(|e| {
            if matches!(e, ShareError::ImportFailed(_)) {
                e
            } else {
                ShareError::ImportFailed(e.to_string())
            }
        })?;

        self.enter(HostState::Verifying);
        if !imported.contains(&fingerprint) {
            return Err(ShareError::VerificationFailed(format!(
                "claimed fingerprint {} is not the key that was sent ({})",
                fingerprint,
                imported.fingerprints.join(", ")
            )));
        }
        if !keyring.key_exists(&fingerprint).await {
            return Err(ShareError::VerificationFailed(format!(
                "key {} not found in keyring after import",
                fingerprint
            )));
        }
        debug!("Verified key {} exists in keyring", fingerprint);

        self.enter(HostState::AwaitingConsent);
        let prompt = Prompt::Identity {
            label: label.clone(),
        };
        let accepted = ask_blocking(consent, &prompt);
        self.session.peer_fingerprint = Some(fingerprint.clone());

        self.enter(HostState::Responding);
        let response = if accepted {
            HANDSHAKE_ACCEPTED
        } else {
            HANDSHAKE_REJECTED
        };
        channel.write_line(response).await?;

        if accepted {
            info!("Connection accepted from: {} (fingerprint: {})", label, fingerprint);
            Ok(())
        } else {
            info!("Connection rejected from: {}", label);
            Err(ShareError::ConsentDeclined)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    LoadIdentity,
    SendIdentity,
    AwaitResponse,
    Done(Outcome),
}

/// The presenting side.
#[derive(Debug)]
pub struct ClientHandshake {
    state: ClientState,
    session: HandshakeSession,
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    pub fn new() -> Self {
        ClientHandshake {
            state: ClientState::LoadIdentity,
            session: HandshakeSession::new(Role::Client),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session(&self) -> &HandshakeSession {
        &self.session
    }

    pub fn into_session(self) -> HandshakeSession {
        self.session
    }

    fn enter(&mut self, next: ClientState) {
        debug!("client handshake: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub async fn run<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        keyring: &dyn IdentityProvider,
        config: &SessionConfig,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.drive(channel, keyring, config).await;
        if let Err(e) = &result {
            warn!("Handshake failed in {:?}: {}", self.state, e);
        }
        let outcome = self.session.finish(result);
        self.enter(ClientState::Done(outcome));
        outcome
    }

    async fn drive<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        keyring: &dyn IdentityProvider,
        config: &SessionConfig,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let identity = keyring.default_identity().await?;
        if identity.label.contains('\n') || identity.fingerprint.contains('\n') {
            return Err(ShareError::ProtocolViolation(
                "identity label and fingerprint must be single lines".into(),
            ));
        }
        info!(
            "Using GPG identity: {} (fingerprint: {})",
            identity.label, identity.fingerprint
        );

        self.enter(ClientState::SendIdentity);
        channel.write_line(&identity.label).await?;
        channel.write_line(&identity.fingerprint).await?;
        channel
            .write_block(&identity.public_key_armor, END_PUBLIC_KEY)
            .await?;

        self.enter(ClientState::AwaitResponse);
        let response = channel.read_line(config.max_line_bytes).await?;
        let response = response.trim();
        if response == HANDSHAKE_ACCEPTED {
            info!("Connection accepted by host");
            Ok(())
        } else {
            info!("Connection rejected by host: {}", response);
            Err(ShareError::HandshakeRejected(response.to_string()))
        }
    }
}

/// A handshake with its role fixed at construction.
#[derive(Debug)]
pub enum Handshake {
    Host(HostHandshake),
    Client(ClientHandshake),
}

impl Handshake {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Host => Handshake::Host(HostHandshake::new()),
            Role::Client => Handshake::Client(ClientHandshake::new()),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Handshake::Host(_) => Role::Host,
            Handshake::Client(_) => Role::Client,
        }
    }

    /// Drive the handshake for whichever role this is. The client never
    /// consults `consent`; only the host asks its operator.
    pub async fn run<S>(
        &mut self,
        channel: &mut LineChannel<S>,
        keyring: &dyn IdentityProvider,
        consent: &dyn ConsentGate,
        config: &SessionConfig,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self {
            Handshake::Host(host) => host.run(channel, keyring, consent, config).await,
            Handshake::Client(client) => client.run(channel, keyring, config).await,
        }
    }

    pub fn session(&self) -> &HandshakeSession {
        match self {
            Handshake::Host(host) => host.session(),
            Handshake::Client(client) => client.session(),
        }
    }

    pub fn into_session(self) -> HandshakeSession {
        match self {
            Handshake::Host(host) => host.into_session(),
            Handshake::Client(client) => client.into_session(),
        }
    }
}
