use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::sleep,
};

use crate::{
    auth::{AuthApi, CredentialStore},
    config::Config,
    provider::MusicProvider,
};

/// Where a session is in its lifecycle. `Disconnected` is terminal once
/// reached after a logout or an unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Active,
    Reauthenticating,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The transport rejected the bearer credential
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Connection failed: {0}")]
    Network(String),
    #[error("Connection closed")]
    Closed,
}

/// The persistent, bidirectional transport a session connects through.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    type Link: GatewayLink + Send + 'static;

    /// Opens a connection authenticated with the given bearer token.
    async fn connect(&self, access_token: &str) -> Result<Self::Link, GatewayError>;
}

/// A live connection produced by a [Gateway].
#[async_trait]
pub trait GatewayLink: Send {
    /// Resolves once the link goes down, with the reason.
    async fn closed(&mut self) -> GatewayError;
}

impl GatewayError {
    /// Whether this is the transport's way of saying the access token
    /// expired, which makes renewal worthwhile. Other auth failures are
    /// treated as fatal.
    pub fn is_expiry(&self) -> bool {
        match self {
            Self::Auth(message) => message.to_lowercase().contains("expire"),
            _ => false,
        }
    }
}

enum SessionControl {
    DeviceReady(String),
    Disconnect,
}

enum ActiveOutcome {
    Closed(GatewayError),
    CredentialChanged,
    Disconnect,
}

/// The caller's handle to a running session task.
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    control: mpsc::UnboundedSender<SessionControl>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A watch over the session's state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Reports that a local playback device is ready, asking the
    /// provider to move playback there. Best-effort.
    pub fn device_ready(&self, device_id: &str) {
        self.control
            .send(SessionControl::DeviceReady(device_id.to_string()))
            .ok();
    }

    /// Explicit logout. Terminal.
    pub fn disconnect(&self) {
        self.control.send(SessionControl::Disconnect).ok();
    }
}

/// One per client socket: owns authentication state, renewal, and
/// reconnect backoff.
///
/// The session is an explicit state machine:
/// `Disconnected → Connecting → Authenticated → Active ⇄ Reauthenticating`,
/// ending in `Disconnected` on logout or unrecoverable auth failure.
/// Expired-credential errors go through single-flight renewal on the
/// [CredentialStore]; other connection errors retry with bounded
/// exponential backoff, which an externally renewed credential cuts
/// short.
pub struct ConnectionSession<G, A, P> {
    gateway: Arc<G>,
    credentials: Arc<CredentialStore<A>>,
    provider: Arc<P>,
    config: Config,
    state: watch::Sender<SessionState>,
    control: mpsc::UnboundedReceiver<SessionControl>,
}

impl<G, A, P> ConnectionSession<G, A, P>
where
    G: Gateway,
    A: AuthApi,
    P: MusicProvider,
{
    pub fn spawn(
        gateway: Arc<G>,
        credentials: Arc<CredentialStore<A>>,
        provider: Arc<P>,
        config: Config,
    ) -> SessionHandle {
        let (state, state_watch) = watch::channel(SessionState::Disconnected);
        let (control_sender, control) = mpsc::unbounded_channel();

        let session = Self {
            gateway,
            credentials,
            provider,
            config,
            state,
            control,
        };

        tokio::spawn(session.run());

        SessionHandle {
            state: state_watch,
            control: control_sender,
        }
    }

    async fn run(mut self) {
        let mut changes = self.credentials.changes();
        let mut attempts: u32 = 0;

        loop {
            // Consume any notification caused by our own renewal, so the
            // active loop only reacts to external ones
            changes.borrow_and_update();

            let Some(credential) = self.credentials.current() else {
                break;
            };

            self.set(SessionState::Connecting);

            match self.gateway.connect(&credential.access_token).await {
                Ok(mut link) => {
                    attempts = 0;
                    self.set(SessionState::Authenticated);
                    self.set(SessionState::Active);
                    info!("Session connected");

                    match self.active(&mut link, &mut changes).await {
                        ActiveOutcome::Closed(reason) => {
                            if !self.handle_failure(reason, &mut attempts, &mut changes).await {
                                break;
                            }
                        }
                        ActiveOutcome::CredentialChanged => {}
                        ActiveOutcome::Disconnect => break,
                    }
                }
                Err(error) => {
                    if !self.handle_failure(error, &mut attempts, &mut changes).await {
                        break;
                    }
                }
            }
        }

        info!("Session disconnected");
        self.set(SessionState::Disconnected);
    }

    /// Runs the session while the link is up, reacting to control
    /// messages and credential changes.
    async fn active(
        &mut self,
        link: &mut G::Link,
        changes: &mut watch::Receiver<u64>,
    ) -> ActiveOutcome {
        loop {
            select! {
                reason = link.closed() => return ActiveOutcome::Closed(reason),
                changed = changes.changed() => {
                    if changed.is_err() {
                        continue;
                    }

                    if self.credentials.current().is_none() {
                        return ActiveOutcome::Disconnect;
                    }

                    info!("Credential renewed elsewhere, reconnecting with it");
                    return ActiveOutcome::CredentialChanged;
                }
                control = self.control.recv() => match control {
                    Some(SessionControl::DeviceReady(device_id)) => {
                        // Best-effort: a failed transfer does not affect
                        // the session
                        if let Err(error) = self.provider.transfer_playback(&device_id).await {
                            warn!("Could not transfer playback to device {}: {}", device_id, error);
                        }
                    }
                    Some(SessionControl::Disconnect) | None => return ActiveOutcome::Disconnect,
                },
            }
        }
    }

    /// Decides what a connection failure means. Returns whether the
    /// session should try connecting again.
    async fn handle_failure(
        &mut self,
        error: GatewayError,
        attempts: &mut u32,
        changes: &mut watch::Receiver<u64>,
    ) -> bool {
        if error.is_expiry() {
            self.set(SessionState::Reauthenticating);

            return match self.credentials.renew().await {
                Ok(_) => true,
                Err(renew_error) => {
                    // The store has already cleared itself
                    error!("Credential renewal failed: {}", renew_error);
                    false
                }
            };
        }

        match error {
            GatewayError::Auth(message) => {
                error!("Authentication rejected: {}", message);
                self.credentials.clear();
                false
            }
            reason => {
                if *attempts >= self.config.max_reconnect_attempts {
                    warn!("Giving up after {} reconnect attempts: {}", attempts, reason);
                    return false;
                }

                let delay = self.config.backoff_delay(*attempts);
                *attempts += 1;
                debug!("Reconnecting in {:?} (attempt {})", delay, attempts);

                select! {
                    _ = sleep(delay) => {}
                    changed = changes.changed() => {
                        if changed.is_ok() {
                            if self.credentials.current().is_none() {
                                return false;
                            }

                            info!("Credential updated externally, superseding backoff");
                            *attempts = 0;
                        }
                    }
                    control = self.control.recv() => {
                        if matches!(control, Some(SessionControl::Disconnect) | None) {
                            return false;
                        }
                    }
                }

                true
            }
        }
    }

    fn set(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}
