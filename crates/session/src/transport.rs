// crates/session/src/transport.rs
//! Seam between the lifecycle core and the messaging transport.
//!
//! The wire protocol lives behind [`Transport`]. A connected session is
//! represented by a single ordered event stream plus a close handle; the
//! core never calls into the transport for anything else.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::SocketConfig;
use crate::credentials::Credential;
use crate::error::TransportError;

/// Builds live transport sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session. Must not retry internally.
    async fn connect(&self, request: ConnectRequest) -> Result<TransportSession, TransportError>;
}

/// Everything the transport needs to bring one session up.
#[derive(Clone)]
pub struct ConnectRequest {
    pub account_id: String,
    pub credential_dir: PathBuf,
    /// `None` means a fresh pairing.
    pub credential: Option<Credential>,
    pub config: SocketConfig,
    pub message_resolver: Arc<dyn MessageResolver>,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("account_id", &self.account_id)
            .field("credential_dir", &self.credential_dir)
            .field("has_credential", &self.credential.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A live session: its event stream and a way to tear it down.
pub struct TransportSession {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub control: Arc<dyn SocketControl>,
}

/// Close handle for a live session.
pub trait SocketControl: Send + Sync {
    /// Tear the socket down. Ending the event stream is the expected effect.
    fn close(&self);
}

/// Answers the transport's "resend this message" lookups.
pub trait MessageResolver: Send + Sync {
    fn resolve(&self, key: &MessageKey) -> Option<serde_json::Value>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: Option<String>,
    pub id: Option<String>,
    pub from_me: bool,
}

/// The lifecycle core never stores messages, so every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMessageResolver;

impl MessageResolver for NoopMessageResolver {
    fn resolve(&self, _key: &MessageKey) -> Option<serde_json::Value> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// New credential material that must be persisted.
    CredsUpdate(Credential),
    ConnectionUpdate(ConnectionUpdate),
    /// Low-level socket error. Informational.
    SocketError { message: String },
    /// Low-level socket close. Informational; the close that matters arrives
    /// as a `ConnectionUpdate`.
    SocketClosed { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionPhase>,
    pub qr: Option<String>,
    pub last_disconnect: Option<RawDisconnect>,
    pub is_new_login: Option<bool>,
    pub is_online: Option<bool>,
}

impl ConnectionUpdate {
    pub fn qr(code: impl Into<String>) -> Self {
        Self {
            qr: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn open() -> Self {
        Self {
            connection: Some(ConnectionPhase::Open),
            ..Self::default()
        }
    }

    pub fn close(last_disconnect: Option<RawDisconnect>) -> Self {
        Self {
            connection: Some(ConnectionPhase::Close),
            last_disconnect,
            ..Self::default()
        }
    }
}

/// Whatever the transport attached to a close. Shapes vary by source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDisconnect {
    /// A plain error with only a message.
    Error { message: String },
    Text(String),
    /// Structured payload, possibly Boom-shaped and possibly nested under
    /// `error` or `lastDisconnect.error`.
    Payload(serde_json::Value),
}

impl RawDisconnect {
    /// Shorthand for a Boom-shaped payload carrying `status_code`.
    pub fn status(status_code: u16) -> Self {
        Self::Payload(serde_json::json!({
            "output": { "statusCode": status_code },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_resolver_misses() {
        let key = MessageKey {
            remote_jid: Some("1@s.whatsapp.net".into()),
            id: Some("ABC".into()),
            from_me: true,
        };
        assert!(NoopMessageResolver.resolve(&key).is_none());
    }

    #[test]
    fn test_update_constructors() {
        let update = ConnectionUpdate::close(Some(RawDisconnect::status(515)));
        assert_eq!(update.connection, Some(ConnectionPhase::Close));
        assert!(update.qr.is_none());
        assert_eq!(
            update.last_disconnect,
            Some(RawDisconnect::Payload(
                serde_json::json!({"output": {"statusCode": 515}})
            ))
        );
    }
}
