//! Session lifecycle core for the WhatsApp gateway.
//!
//! Keeps a transport connection authenticated for one account at a time:
//! durable credentials with backup/restore, a connection factory, disconnect
//! classification, the restart-after-pairing rebuild, and the single-flight
//! QR login coordinator.

pub mod account;
pub mod classify;
pub mod config;
pub mod credentials;
pub mod error;
pub mod factory;
pub mod login;
pub mod policy;
pub mod qr;
pub mod router;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod fake_transport;

pub use account::{Account, AccountResolver, DirectoryAccounts, DEFAULT_ACCOUNT_ID};
pub use classify::DisconnectCause;
pub use config::{ClientIdentity, LoginTimings, SessionConfig, SocketConfig};
pub use credentials::{Credential, CredentialStore, CredentialWriter, SelfId};
pub use error::{
    AccountError, ConnectError, CredentialError, LoginError, QrRenderError, TransportError,
};
pub use factory::{ConnectOptions, Connection, ConnectionControl, ConnectionFactory};
pub use login::{
    AttemptState, LoginCoordinator, LoginRegistry, LoginStart, LoginWait, StartLoginOptions,
    StartOutcome, WaitLoginOptions, WaitOutcome,
};
pub use policy::{ReconnectAction, ReconnectPolicy};
pub use qr::{PngQrRenderer, QrRenderer};
pub use router::{ConnectionClosed, Lifecycle};
pub use transport::{
    ConnectRequest, ConnectionPhase, ConnectionUpdate, MessageKey, MessageResolver,
    NoopMessageResolver, RawDisconnect, SocketControl, Transport, TransportEvent,
    TransportSession,
};
