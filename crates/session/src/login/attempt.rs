// crates/session/src/login/attempt.rs
//! State of a single interactive login attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::account::Account;
use crate::factory::ConnectionControl;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum AttemptState {
    AwaitingQr,
    AwaitingConnection,
    /// Rebuilding the socket after the post-pairing restart request.
    Restarting,
    Connected,
    Failed {
        message: String,
        status_code: Option<u16>,
    },
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedQr {
    pub code: String,
    pub data_url: String,
}

pub struct LoginAttempt {
    id: Uuid,
    account: Account,
    started_at: DateTime<Utc>,
    verbose: bool,
    control: RwLock<ConnectionControl>,
    qr: RwLock<Option<IssuedQr>>,
    state: watch::Sender<AttemptState>,
    cancelled: AtomicBool,
}

impl LoginAttempt {
    pub fn new(account: Account, verbose: bool, control: ConnectionControl) -> Self {
        let (state, _) = watch::channel(AttemptState::AwaitingQr);
        Self {
            id: Uuid::new_v4(),
            account,
            started_at: Utc::now(),
            verbose,
            control: RwLock::new(control),
            qr: RwLock::new(None),
            state,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        self.started_at + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
    }

    pub fn state(&self) -> AttemptState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AttemptState> {
        self.state.subscribe()
    }

    /// Move to `next` unless the attempt already reached a terminal state.
    /// Returns whether the state changed.
    pub fn transition(&self, next: AttemptState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn fail(&self, message: impl Into<String>, status_code: Option<u16>) -> bool {
        self.transition(AttemptState::Failed {
            message: message.into(),
            status_code,
        })
    }

    /// Record the QR shown to the user and move on from `AwaitingQr`.
    /// A restart or terminal state reached meanwhile is left alone.
    pub fn mark_qr_issued(&self, qr: IssuedQr) {
        match self.qr.write() {
            Ok(mut guard) => *guard = Some(qr),
            Err(e) => tracing::error!("RwLock poisoned writing qr: {e}"),
        }
        self.state.send_if_modified(|current| {
            if *current != AttemptState::AwaitingQr {
                return false;
            }
            *current = AttemptState::AwaitingConnection;
            true
        });
    }

    pub fn qr(&self) -> Option<IssuedQr> {
        self.qr.read().ok().and_then(|guard| guard.clone())
    }

    pub fn control(&self) -> Option<ConnectionControl> {
        self.control.read().ok().map(|guard| guard.clone())
    }

    /// Swap in the handle of a rebuilt connection.
    pub fn replace_control(&self, control: ConnectionControl) {
        match self.control.write() {
            Ok(mut guard) => *guard = control,
            Err(e) => tracing::error!("RwLock poisoned replacing connection: {e}"),
        }
    }

    /// Close whichever connection the attempt currently owns.
    pub fn close(&self) {
        if let Some(control) = self.control() {
            control.close();
        }
    }

    /// Supersede the attempt: no further side effects, connection closed.
    /// Waiters see `Failed` with `message` unless a terminal state was
    /// already reached.
    pub fn cancel(&self, message: impl Into<String>) {
        self.cancelled.store(true, Ordering::Release);
        self.fail(message, None);
        self.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoginAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginAttempt")
            .field("id", &self.id)
            .field("account_id", &self.account.id)
            .field("started_at", &self.started_at)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SocketControl;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSocket(AtomicUsize);

    impl SocketControl for CountingSocket {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attempt() -> (LoginAttempt, Arc<CountingSocket>) {
        let socket = Arc::new(CountingSocket::default());
        let control = ConnectionControl::new(Uuid::new_v4(), socket.clone());
        let account = Account {
            id: "main".into(),
            credential_dir: PathBuf::from("/tmp/main"),
            is_legacy_layout: false,
        };
        (LoginAttempt::new(account, false, control), socket)
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let (attempt, _) = attempt();
        assert_eq!(attempt.state(), AttemptState::AwaitingQr);
        assert!(attempt.transition(AttemptState::AwaitingConnection));
        assert!(attempt.transition(AttemptState::Connected));
        assert!(!attempt.fail("late failure", Some(428)));
        assert_eq!(attempt.state(), AttemptState::Connected);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let (attempt, _) = attempt();
        let mut rx = attempt.subscribe();
        attempt.fail("boom", None);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_terminal());
    }

    #[test]
    fn test_cancel_closes_current_connection_once() {
        let (attempt, first) = attempt();
        let second = Arc::new(CountingSocket::default());
        attempt.replace_control(ConnectionControl::new(Uuid::new_v4(), second.clone()));

        attempt.cancel("login reset");
        attempt.close();
        assert!(attempt.is_cancelled());
        assert_eq!(first.0.load(Ordering::SeqCst), 0);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters_with_failure() {
        let (attempt, _) = attempt();
        let mut rx = attempt.subscribe();

        attempt.cancel("login reset");
        rx.changed().await.unwrap();
        assert_eq!(
            *rx.borrow(),
            AttemptState::Failed {
                message: "login reset".into(),
                status_code: None,
            }
        );
    }

    #[test]
    fn test_cancel_keeps_reached_terminal_state() {
        let (attempt, socket) = attempt();
        attempt.transition(AttemptState::Connected);

        attempt.cancel("superseded");
        assert_eq!(attempt.state(), AttemptState::Connected);
        assert_eq!(socket.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_qr_issue_only_advances_from_awaiting_qr() {
        let (attempt, _) = attempt();
        attempt.transition(AttemptState::Restarting);
        attempt.mark_qr_issued(IssuedQr {
            code: "1@ABC".into(),
            data_url: "data:image/png;base64,AA".into(),
        });
        assert_eq!(attempt.state(), AttemptState::Restarting);
        assert_eq!(attempt.qr().unwrap().code, "1@ABC");
    }

    #[test]
    fn test_expires_at_adds_ttl() {
        let (attempt, _) = attempt();
        let expires = attempt.expires_at(Duration::from_secs(60));
        assert_eq!((expires - attempt.started_at()).num_seconds(), 60);
    }
}
