// crates/session/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading, writing or clearing stored credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No usable credentials in {dir}")]
    NotFound { dir: PathBuf },

    #[error("Permission denied accessing credentials: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed credentials in {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Failed to serialize credentials: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Credential save queue is closed")]
    QueueClosed,
}

impl CredentialError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                dir: path.parent().map(PathBuf::from).unwrap_or(path),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors a [`Transport`](crate::transport::Transport) implementation reports
/// when a session cannot be constructed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),

    #[error("transport closed")]
    Closed,
}

/// Errors from [`ConnectionFactory::create`](crate::factory::ConnectionFactory::create).
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("credential store: {0}")]
    Credentials(#[from] CredentialError),

    #[error("{0}")]
    Transport(#[from] TransportError),
}

/// Errors from account lookup.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Invalid account id: {0:?}")]
    InvalidId(String),

    #[error("Account could not be resolved: {0}")]
    Unresolved(String),
}

/// Errors from QR rendering.
#[derive(Debug, Error)]
pub enum QrRenderError {
    #[error("QR encode failed: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("PNG encode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// The only error the login coordinator surfaces; everything past account
/// resolution is reported through result values.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error(transparent)]
    Account(#[from] AccountError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_maps_not_found_to_parent_dir() {
        let err = CredentialError::io(
            "/tmp/acct/creds.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        match err {
            CredentialError::NotFound { dir } => assert_eq!(dir, PathBuf::from("/tmp/acct")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_io_keeps_other_kinds() {
        let err = CredentialError::io(
            "/tmp/acct/creds.json",
            std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        );
        assert!(matches!(err, CredentialError::Io { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_connect_error_display_passes_transport_text() {
        let err = ConnectError::from(TransportError::Connect("dns failure".into()));
        assert_eq!(err.to_string(), "transport connect failed: dns failure");
    }
}
