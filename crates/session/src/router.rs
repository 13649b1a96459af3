// crates/session/src/router.rs
//! Turns one connection's raw transport events into lifecycle signals.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::{self, DisconnectCause};
use crate::credentials::Credential;
use crate::transport::{ConnectionPhase, ConnectionUpdate, RawDisconnect, TransportEvent};

/// Message of the close emitted when the event stream ends on its own.
pub const STREAM_ENDED_MESSAGE: &str = "connection closed";

#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Open,
    Closed(ConnectionClosed),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionClosed {
    pub cause: DisconnectCause,
    pub status_code: Option<u16>,
    pub message: String,
    #[serde(skip)]
    pub raw: Option<RawDisconnect>,
}

impl ConnectionClosed {
    pub fn from_raw(raw: Option<RawDisconnect>) -> Self {
        let cause = classify::classify(raw.as_ref());
        let status_code = raw.as_ref().and_then(classify::status_code);
        let message = match &raw {
            Some(r) => classify::format_error(r),
            None => STREAM_ENDED_MESSAGE.to_string(),
        };
        Self {
            cause,
            status_code,
            message,
            raw,
        }
    }

    pub(crate) fn stream_ended() -> Self {
        Self {
            cause: DisconnectCause::ConnectionClosed,
            status_code: None,
            message: STREAM_ENDED_MESSAGE.to_string(),
            raw: None,
        }
    }
}

pub(crate) struct RouterOutputs {
    pub qr: Option<oneshot::Receiver<String>>,
    pub lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
}

/// Spawn the routing task for one connection.
///
/// `on_creds` runs inline for every credential update, in stream order.
pub(crate) fn spawn<F>(
    connection_id: Uuid,
    account_id: String,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    with_qr: bool,
    on_creds: F,
) -> RouterOutputs
where
    F: Fn(Credential) + Send + 'static,
{
    let (qr_tx, qr_rx) = if with_qr {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

    let router = EventRouter {
        connection_id,
        account_id,
        qr: qr_tx,
        lifecycle: lifecycle_tx,
        closed: false,
    };
    tokio::spawn(router.run(events, on_creds));

    RouterOutputs {
        qr: qr_rx,
        lifecycle: lifecycle_rx,
    }
}

struct EventRouter {
    connection_id: Uuid,
    account_id: String,
    qr: Option<oneshot::Sender<String>>,
    lifecycle: mpsc::UnboundedSender<Lifecycle>,
    closed: bool,
}

impl EventRouter {
    async fn run<F>(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>, on_creds: F)
    where
        F: Fn(Credential),
    {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::CredsUpdate(cred) => on_creds(cred),
                TransportEvent::ConnectionUpdate(update) => self.on_update(update),
                TransportEvent::SocketError { message } => {
                    error!(connection_id = %self.connection_id, error = %message, "socket error");
                }
                TransportEvent::SocketClosed { code, reason } => {
                    warn!(connection_id = %self.connection_id, code, reason = %reason, "socket closed");
                }
            }
        }

        if !self.closed {
            debug!(connection_id = %self.connection_id, "event stream ended without close");
            self.emit(Lifecycle::Closed(ConnectionClosed::stream_ended()));
        }
    }

    fn on_update(&mut self, update: ConnectionUpdate) {
        info!(
            connection_id = %self.connection_id,
            account_id = %self.account_id,
            connection = ?update.connection,
            is_new_login = ?update.is_new_login,
            is_online = ?update.is_online,
            has_qr = update.qr.is_some(),
            has_disconnect = update.last_disconnect.is_some(),
            "connection update"
        );

        if let Some(code) = update.qr {
            // Only the first code is surfaced; rotations are ignored
            if let Some(tx) = self.qr.take() {
                let _ = tx.send(code);
            }
        }

        match update.connection {
            Some(ConnectionPhase::Open) => {
                info!(connection_id = %self.connection_id, account_id = %self.account_id, "connection open");
                self.emit(Lifecycle::Open);
            }
            Some(ConnectionPhase::Close) => {
                let closed = ConnectionClosed::from_raw(update.last_disconnect);
                self.log_close(&closed);
                self.emit(Lifecycle::Closed(closed));
                self.closed = true;
            }
            Some(ConnectionPhase::Connecting) | None => {}
        }
    }

    fn emit(&self, signal: Lifecycle) {
        if self.closed {
            return;
        }
        // Receiver dropped means nobody is waiting any more
        let _ = self.lifecycle.send(signal);
    }

    fn log_close(&self, closed: &ConnectionClosed) {
        match closed.cause {
            DisconnectCause::LoggedOut => error!(
                connection_id = %self.connection_id,
                status = ?closed.status_code,
                "session logged out; relink with a new QR code"
            ),
            DisconnectCause::RestartRequired => info!(
                connection_id = %self.connection_id,
                "server requested restart after pairing"
            ),
            DisconnectCause::TimedOut => warn!(
                connection_id = %self.connection_id,
                error = %closed.message,
                "connection timed out"
            ),
            DisconnectCause::ConnectionLost => warn!(
                connection_id = %self.connection_id,
                error = %closed.message,
                "connection lost"
            ),
            _ => warn!(
                connection_id = %self.connection_id,
                status = ?closed.status_code,
                error = %closed.message,
                "connection closed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn start(with_qr: bool) -> (mpsc::UnboundedSender<TransportEvent>, RouterOutputs, Arc<Mutex<Vec<Credential>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&saved);
        let outputs = spawn(Uuid::new_v4(), "main".into(), rx, with_qr, move |c| {
            sink.lock().unwrap().push(c)
        });
        (tx, outputs, saved)
    }

    #[tokio::test]
    async fn test_first_qr_only() {
        let (tx, mut out, _) = start(true);
        tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::qr("1@ABC"))).unwrap();
        tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::qr("2@DEF"))).unwrap();

        let qr = out.qr.take().unwrap().await.unwrap();
        assert_eq!(qr, "1@ABC");
    }

    #[tokio::test]
    async fn test_no_qr_receiver_when_disabled() {
        let (tx, out, _) = start(false);
        assert!(out.qr.is_none());
        tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::qr("1@ABC"))).unwrap();
    }

    #[tokio::test]
    async fn test_open_then_close_classified() {
        let (tx, mut out, _) = start(true);
        tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::open())).unwrap();
        tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::close(Some(
            RawDisconnect::status(515),
        ))))
        .unwrap();
        drop(tx);

        assert_eq!(out.lifecycle.recv().await, Some(Lifecycle::Open));
        match out.lifecycle.recv().await {
            Some(Lifecycle::Closed(closed)) => {
                assert_eq!(closed.cause, DisconnectCause::RestartRequired);
                assert_eq!(closed.status_code, Some(515));
                assert_eq!(closed.message, "status=515");
            }
            other => panic!("unexpected: {other:?}"),
        }
        // Only one terminal signal, no synthetic close after a real one
        assert_eq!(out.lifecycle.recv().await, None);
    }

    #[tokio::test]
    async fn test_stream_end_emits_synthetic_close() {
        let (tx, mut out, _) = start(true);
        drop(tx);
        match out.lifecycle.recv().await {
            Some(Lifecycle::Closed(closed)) => {
                assert_eq!(closed.cause, DisconnectCause::ConnectionClosed);
                assert_eq!(closed.message, STREAM_ENDED_MESSAGE);
                assert_eq!(closed.status_code, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_creds_updates_forwarded_in_order() {
        let (tx, mut out, saved) = start(false);
        for n in 0..3 {
            tx.send(TransportEvent::CredsUpdate(Credential::new(serde_json::json!({ "n": n }))))
                .unwrap();
        }
        tx.send(TransportEvent::SocketError { message: "noise".into() }).unwrap();
        drop(tx);
        let _ = out.lifecycle.recv().await;

        let seen: Vec<i64> = saved
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.as_value()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
