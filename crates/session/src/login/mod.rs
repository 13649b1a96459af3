// crates/session/src/login/mod.rs
//! Interactive QR login: at most one attempt per account.
//!
//! `start_login` builds a QR-enabled connection and returns once the first
//! QR code is rendered. A background task then drives the attempt to a
//! terminal state, rebuilding the connection once if the server asks for a
//! restart right after pairing. `wait_for_login` observes that state.

pub mod attempt;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::{Account, AccountResolver};
use crate::config::LoginTimings;
use crate::credentials::CredentialStore;
use crate::error::LoginError;
use crate::factory::{ConnectOptions, Connection, ConnectionFactory};
use crate::policy::{ReconnectAction, ReconnectPolicy};
use crate::qr::{self, PngQrRenderer, QrRenderer};

pub use attempt::{AttemptState, IssuedQr, LoginAttempt};
pub use registry::LoginRegistry;

pub const QR_READY_MESSAGE: &str = "QR code ready. Scan it in WhatsApp under Linked Devices.";
pub const CONNECTED_MESSAGE: &str = "Connected! WhatsApp is ready.";
pub const NO_ACTIVE_LOGIN_MESSAGE: &str = "No active login. Generate a QR code first.";
pub const WAIT_TIMEOUT_MESSAGE: &str = "timeout waiting for QR scan. Try again.";
pub const QR_TIMEOUT_MESSAGE: &str = "timeout waiting for QR code";
pub const LOGGED_OUT_MESSAGE: &str = "session logged out";
pub const TASK_ABORTED_MESSAGE: &str = "login task terminated unexpectedly";
pub const RESET_MESSAGE: &str = "login reset";
pub const SUPERSEDED_MESSAGE: &str = "superseded by a newer login attempt";

const RESTART_STATUS: u16 = 515;
const LOGGED_OUT_STATUS: u16 = 401;

#[derive(Debug, Clone, Default)]
pub struct StartLoginOptions {
    pub account_id: Option<String>,
    /// Clear existing credentials and pair again.
    pub force: bool,
    pub verbose: bool,
    /// Caps the QR wait.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct WaitLoginOptions {
    pub account_id: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StartOutcome {
    QrReady,
    AlreadyConnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStart {
    pub outcome: StartOutcome,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_data_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
}

impl LoginStart {
    fn bare(outcome: StartOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
            qr_data_url: None,
            expires_at: None,
            duration_ms: None,
            attempt_id: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self::bare(StartOutcome::Failed, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitOutcome {
    Connected,
    Failed,
    TimedOut,
    NoActiveLogin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginWait {
    pub outcome: WaitOutcome,
    pub connected: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl LoginWait {
    fn new(outcome: WaitOutcome, message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            outcome,
            connected: outcome == WaitOutcome::Connected,
            message: message.into(),
            status_code,
        }
    }
}

enum QrWait {
    Code(String),
    TimedOut,
    Resolved(AttemptState),
}

#[derive(Clone)]
pub struct LoginCoordinator {
    accounts: Arc<dyn AccountResolver>,
    store: CredentialStore,
    factory: ConnectionFactory,
    renderer: Arc<dyn QrRenderer>,
    registry: LoginRegistry,
    timings: LoginTimings,
}

impl LoginCoordinator {
    pub fn new(
        accounts: Arc<dyn AccountResolver>,
        factory: ConnectionFactory,
        registry: LoginRegistry,
    ) -> Self {
        Self {
            accounts,
            store: factory.store().clone(),
            factory,
            renderer: Arc::new(PngQrRenderer::default()),
            registry,
            timings: LoginTimings::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn QrRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_timings(mut self, timings: LoginTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn registry(&self) -> &LoginRegistry {
        &self.registry
    }

    pub async fn start_login(&self, opts: StartLoginOptions) -> Result<LoginStart, LoginError> {
        let account = self.accounts.resolve(opts.account_id.as_deref())?;
        let dir = &account.credential_dir;

        if !opts.force && self.store.exists(dir).await {
            let who = self.store.read_self_id(dir);
            info!(account_id = %account.id, who = who.display(), "already linked; not starting login");
            return Ok(LoginStart::bare(
                StartOutcome::AlreadyConnected,
                format!(
                    "WhatsApp is already connected ({}). Use force to link again.",
                    who.display()
                ),
            ));
        }

        self.evict(&account.id, SUPERSEDED_MESSAGE);

        if opts.force {
            if let Err(e) = self.store.clear(&account).await {
                warn!(account_id = %account.id, error = %e, "failed clearing credentials before relink");
            }
        }

        let options = ConnectOptions {
            with_qr: true,
            verbose: opts.verbose,
        };
        let mut connection = match self.factory.create(&account, options).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(account_id = %account.id, error = %e, "failed to start login");
                self.evict(&account.id, SUPERSEDED_MESSAGE);
                return Ok(LoginStart::failed(format!("Failed to start login: {e}")));
            }
        };

        let qr_rx = connection.take_qr();
        let attempt = Arc::new(LoginAttempt::new(
            account.clone(),
            opts.verbose,
            connection.control(),
        ));
        if let Some(previous) = self.registry.insert(Arc::clone(&attempt)) {
            // Registered by a concurrent start_login; the newest attempt wins
            info!(account_id = %account.id, superseded = %previous.id(), "superseding login attempt");
            previous.cancel(SUPERSEDED_MESSAGE);
        }
        info!(
            account_id = %account.id,
            attempt_id = %attempt.id(),
            connection_id = %connection.id(),
            "login attempt started"
        );

        self.spawn_resolution(Arc::clone(&attempt), connection);

        let qr_wait = opts
            .timeout
            .map_or(self.timings.qr_wait, |t| t.min(self.timings.qr_wait));
        let code = match wait_for_qr(&attempt, qr_rx, qr_wait).await {
            QrWait::Code(code) => code,
            QrWait::TimedOut => {
                warn!(account_id = %account.id, attempt_id = %attempt.id(), "no QR code before timeout");
                self.abandon(&attempt, QR_TIMEOUT_MESSAGE);
                return Ok(LoginStart::failed(format!(
                    "Failed to generate QR code: {QR_TIMEOUT_MESSAGE}"
                )));
            }
            QrWait::Resolved(AttemptState::Connected) => {
                self.finish(&attempt);
                return Ok(LoginStart::bare(
                    StartOutcome::AlreadyConnected,
                    CONNECTED_MESSAGE,
                ));
            }
            QrWait::Resolved(state) => {
                let message = match state {
                    AttemptState::Failed { message, .. } => message,
                    _ => "connection closed before a QR code was issued".to_string(),
                };
                self.abandon(&attempt, &message);
                return Ok(LoginStart::failed(format!(
                    "Failed to generate QR code: {message}"
                )));
            }
        };

        let data_url = match self.renderer.render_png_base64(&code) {
            Ok(b64) => qr::data_url(&b64),
            Err(e) => {
                error!(account_id = %account.id, error = %e, "failed to render QR code");
                self.abandon(&attempt, "failed to render QR code");
                return Ok(LoginStart::failed(format!("Failed to render QR code: {e}")));
            }
        };
        attempt.mark_qr_issued(IssuedQr {
            code,
            data_url: data_url.clone(),
        });
        info!(account_id = %account.id, attempt_id = %attempt.id(), "QR code issued");

        let ttl = self.timings.attempt_ttl;
        Ok(LoginStart {
            outcome: StartOutcome::QrReady,
            message: QR_READY_MESSAGE.to_string(),
            qr_data_url: Some(data_url),
            expires_at: Some(attempt.expires_at(ttl)),
            duration_ms: Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
            attempt_id: Some(attempt.id()),
        })
    }

    pub async fn wait_for_login(&self, opts: WaitLoginOptions) -> Result<LoginWait, LoginError> {
        let account = self.accounts.resolve(opts.account_id.as_deref())?;
        let Some(attempt) = self.registry.get(&account.id) else {
            return Ok(LoginWait::new(
                WaitOutcome::NoActiveLogin,
                NO_ACTIVE_LOGIN_MESSAGE,
                None,
            ));
        };

        let timeout = opts
            .timeout
            .unwrap_or(self.timings.default_wait)
            .max(self.timings.min_wait);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = attempt.subscribe();
        let mut tick = tokio::time::interval(self.timings.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            match attempt.state() {
                AttemptState::Connected => {
                    self.finish(&attempt);
                    info!(account_id = %account.id, attempt_id = %attempt.id(), "login connected");
                    return Ok(LoginWait::new(WaitOutcome::Connected, CONNECTED_MESSAGE, None));
                }
                AttemptState::Failed {
                    message,
                    status_code,
                } => {
                    self.finish(&attempt);
                    warn!(account_id = %account.id, attempt_id = %attempt.id(), status = ?status_code, error = %message, "login failed");
                    return Ok(LoginWait::new(
                        WaitOutcome::Failed,
                        format!("Login failed: {message}"),
                        status_code,
                    ));
                }
                _ => {}
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(account_id = %account.id, attempt_id = %attempt.id(), "wait_for_login timed out");
                    return Ok(LoginWait::new(WaitOutcome::TimedOut, WAIT_TIMEOUT_MESSAGE, None));
                }
                _ = changes.changed() => {}
                _ = tick.tick() => {}
            }
        }
    }

    /// Close and forget the account's attempt. Returns whether one existed.
    pub fn reset_login(
        &self,
        account_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<bool, LoginError> {
        let account = self.accounts.resolve(account_id)?;
        let removed = self.evict(&account.id, RESET_MESSAGE);
        if let Some(reason) = reason {
            info!(account_id = %account.id, reason, removed, "login reset");
        }
        Ok(removed)
    }

    /// Cancel and forget the account's attempt; its waiters see `message`.
    fn evict(&self, account_id: &str, message: &str) -> bool {
        let removed = self.registry.remove(account_id);
        if let Some(attempt) = &removed {
            attempt.cancel(message);
        }
        removed.is_some()
    }

    /// Drop `attempt` without touching a newer one for the same account.
    fn abandon(&self, attempt: &LoginAttempt, message: &str) {
        self.registry.remove_if_same(attempt);
        attempt.cancel(message);
    }

    fn finish(&self, attempt: &LoginAttempt) {
        self.registry.remove_if_same(attempt);
        attempt.close();
    }

    fn spawn_resolution(&self, attempt: Arc<LoginAttempt>, connection: Connection) {
        let this = self.clone();
        let task_attempt = Arc::clone(&attempt);
        let handle = tokio::spawn(async move { this.resolve(task_attempt, connection).await });

        tokio::spawn(async move {
            if let Err(e) = handle.await {
                error!(
                    account_id = %attempt.account().id,
                    attempt_id = %attempt.id(),
                    error = %e,
                    "login task aborted"
                );
                attempt.fail(TASK_ABORTED_MESSAGE, None);
            }
        });
    }

    async fn resolve(&self, attempt: Arc<LoginAttempt>, mut connection: Connection) {
        let account = attempt.account().clone();
        let mut restarted = false;

        loop {
            let result = connection.wait_for_connection().await;
            if attempt.is_cancelled() {
                debug!(attempt_id = %attempt.id(), "attempt superseded; ignoring outcome");
                return;
            }
            let closed = match result {
                Ok(()) => {
                    attempt.transition(AttemptState::Connected);
                    info!(account_id = %account.id, attempt_id = %attempt.id(), restarted, "{CONNECTED_MESSAGE}");
                    return;
                }
                Err(closed) => closed,
            };

            match ReconnectPolicy::decide(&closed.cause) {
                ReconnectAction::RebuildWithoutQr if !restarted => {
                    restarted = true;
                    info!(account_id = %account.id, attempt_id = %attempt.id(), "restart requested after pairing; reconnecting");
                    attempt.transition(AttemptState::Restarting);
                    connection.close();
                    match self.rebuild(&attempt, &account).await {
                        Some(next) => connection = next,
                        None => return,
                    }
                }
                ReconnectAction::RebuildWithoutQr => {
                    error!(account_id = %account.id, attempt_id = %attempt.id(), "restart requested again after reconnecting");
                    attempt.fail(
                        format!("restart required again after reconnecting ({})", closed.message),
                        Some(RESTART_STATUS),
                    );
                    return;
                }
                ReconnectAction::ClearCredentialsAndFail => {
                    if let Err(e) = self.store.clear(&account).await {
                        warn!(account_id = %account.id, error = %e, "failed clearing credentials after logout");
                    }
                    error!(account_id = %account.id, attempt_id = %attempt.id(), "session logged out; try again");
                    attempt.fail(
                        LOGGED_OUT_MESSAGE,
                        closed.status_code.or(Some(LOGGED_OUT_STATUS)),
                    );
                    return;
                }
                ReconnectAction::FailAsIs => {
                    error!(account_id = %account.id, attempt_id = %attempt.id(), status = ?closed.status_code, error = %closed.message, "login connection failed");
                    attempt.fail(closed.message, closed.status_code);
                    return;
                }
            }
        }
    }

    /// Second leg of the restart handshake. `None` ends the attempt.
    async fn rebuild(&self, attempt: &LoginAttempt, account: &Account) -> Option<Connection> {
        tokio::time::sleep(self.timings.restart_delay).await;
        if attempt.is_cancelled() {
            return None;
        }

        let options = ConnectOptions {
            with_qr: false,
            verbose: attempt.verbose(),
        };
        match self.factory.create(account, options).await {
            Ok(next) => {
                attempt.replace_control(next.control());
                // A reset may have landed while connecting
                if attempt.is_cancelled() {
                    next.close();
                    return None;
                }
                attempt.transition(AttemptState::AwaitingConnection);
                Some(next)
            }
            Err(e) => {
                error!(account_id = %account.id, attempt_id = %attempt.id(), error = %e, "reconnect after restart failed");
                attempt.fail(e.to_string(), None);
                None
            }
        }
    }
}

async fn wait_for_qr(
    attempt: &LoginAttempt,
    qr_rx: Option<oneshot::Receiver<String>>,
    limit: Duration,
) -> QrWait {
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    let mut changes = attempt.subscribe();
    let mut qr_rx = qr_rx;

    loop {
        let state = attempt.state();
        if state.is_terminal() {
            return QrWait::Resolved(state);
        }

        tokio::select! {
            _ = &mut deadline => return QrWait::TimedOut,
            code = recv_qr(&mut qr_rx) => {
                match code {
                    Ok(code) => return QrWait::Code(code),
                    // Router gone: the resolution task reports why
                    Err(_) => qr_rx = None,
                }
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    return QrWait::Resolved(attempt.state());
                }
            }
        }
    }
}

/// Pends forever once the QR channel is gone.
async fn recv_qr(
    rx: &mut Option<oneshot::Receiver<String>>,
) -> Result<String, oneshot::error::RecvError> {
    match rx {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wait_result_connected_flag_tracks_outcome() {
        assert!(LoginWait::new(WaitOutcome::Connected, CONNECTED_MESSAGE, None).connected);
        assert!(!LoginWait::new(WaitOutcome::TimedOut, WAIT_TIMEOUT_MESSAGE, None).connected);
    }

    #[test]
    fn test_results_serialize_camel_case() {
        let wait = LoginWait::new(WaitOutcome::Failed, "Login failed: x", Some(401));
        assert_eq!(
            serde_json::to_value(&wait).unwrap(),
            serde_json::json!({
                "outcome": "failed",
                "connected": false,
                "message": "Login failed: x",
                "statusCode": 401,
            })
        );

        let start = LoginStart::bare(StartOutcome::AlreadyConnected, "already connected");
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            serde_json::json!({"outcome": "alreadyConnected", "message": "already connected"})
        );
    }
}
