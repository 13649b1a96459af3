// crates/session/src/factory.rs
//! Builds one transport connection for an account from its stored credentials.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};
use uuid::Uuid;

use crate::account::Account;
use crate::config::SocketConfig;
use crate::credentials::CredentialStore;
use crate::error::{ConnectError, CredentialError};
use crate::router::{self, ConnectionClosed, Lifecycle};
use crate::transport::{
    ConnectRequest, MessageResolver, NoopMessageResolver, SocketControl, Transport,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Surface the pairing QR code.
    pub with_qr: bool,
    /// Let the transport log at INFO instead of staying silent.
    pub verbose: bool,
}

#[derive(Clone)]
pub struct ConnectionFactory {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    socket: SocketConfig,
    resolver: Arc<dyn MessageResolver>,
}

impl ConnectionFactory {
    pub fn new(transport: Arc<dyn Transport>, store: CredentialStore, socket: SocketConfig) -> Self {
        Self {
            transport,
            store,
            socket,
            resolver: Arc::new(NoopMessageResolver),
        }
    }

    pub fn with_message_resolver(mut self, resolver: Arc<dyn MessageResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub async fn create(
        &self,
        account: &Account,
        options: ConnectOptions,
    ) -> Result<Connection, ConnectError> {
        let dir = &account.credential_dir;
        fs::create_dir_all(dir).map_err(|e| CredentialError::io(dir, e))?;
        self.store.maybe_restore_from_backup(dir).await;
        let credential = match self.store.load(dir).await {
            Ok(cred) => Some(cred),
            Err(CredentialError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        let mut config = self.socket.clone();
        config.transport_log_level = if options.verbose {
            LevelFilter::INFO
        } else {
            LevelFilter::OFF
        };

        let id = Uuid::new_v4();
        info!(
            account_id = %account.id,
            connection_id = %id,
            fresh_pairing = credential.is_none(),
            with_qr = options.with_qr,
            "creating connection"
        );

        // A logout from here on fences this connection's credential updates
        let writer = self.store.writer(dir);
        let session = self
            .transport
            .connect(ConnectRequest {
                account_id: account.id.clone(),
                credential_dir: dir.clone(),
                credential,
                config,
                message_resolver: Arc::clone(&self.resolver),
            })
            .await?;

        let outputs = router::spawn(
            id,
            account.id.clone(),
            session.events,
            options.with_qr,
            move |cred| writer.write(cred),
        );

        Ok(Connection {
            id,
            control: ConnectionControl::new(id, session.control),
            qr: outputs.qr,
            lifecycle: outputs.lifecycle,
        })
    }
}

/// Idempotent close handle, shareable across tasks.
#[derive(Clone)]
pub struct ConnectionControl {
    id: Uuid,
    socket: Arc<dyn SocketControl>,
    closed: Arc<AtomicBool>,
}

impl ConnectionControl {
    pub(crate) fn new(id: Uuid, socket: Arc<dyn SocketControl>) -> Self {
        Self {
            id,
            socket,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection_id = %self.id, "closing connection");
        self.socket.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConnectionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionControl")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One live transport session as seen by its owner.
pub struct Connection {
    id: Uuid,
    control: ConnectionControl,
    qr: Option<oneshot::Receiver<String>>,
    lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn control(&self) -> ConnectionControl {
        self.control.clone()
    }

    /// The first QR code. `None` when QR is disabled or already taken.
    pub fn take_qr(&mut self) -> Option<oneshot::Receiver<String>> {
        self.qr.take()
    }

    /// Resolve on open; fail with the close details otherwise.
    pub async fn wait_for_connection(&mut self) -> Result<(), ConnectionClosed> {
        match self.lifecycle.recv().await {
            Some(Lifecycle::Open) => Ok(()),
            Some(Lifecycle::Closed(closed)) => Err(closed),
            None => Err(ConnectionClosed::stream_ended()),
        }
    }

    pub fn close(&self) {
        self.control.close();
    }
}
