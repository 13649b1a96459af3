//! Account lookup: maps an optional account id to its credential directory.

use std::path::PathBuf;

use crate::config::SessionConfig;
use crate::error::AccountError;

pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// A resolved account. Read-only for the lifecycle core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub credential_dir: PathBuf,
    /// The directory predates per-account layout and is shared with other
    /// state, so logout must only remove credential files.
    pub is_legacy_layout: bool,
}

/// External account lookup.
pub trait AccountResolver: Send + Sync {
    fn resolve(&self, account_id: Option<&str>) -> Result<Account, AccountError>;
}

/// Resolves accounts to `<root>/<id>`, with an optional legacy directory for
/// the default account.
#[derive(Debug, Clone)]
pub struct DirectoryAccounts {
    root: PathBuf,
    legacy_dir: Option<PathBuf>,
}

impl DirectoryAccounts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            legacy_dir: None,
        }
    }

    pub fn with_legacy_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.legacy_dir = dir;
        self
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.credentials_root.clone())
            .with_legacy_dir(config.legacy_credentials_dir.clone())
    }
}

impl AccountResolver for DirectoryAccounts {
    fn resolve(&self, account_id: Option<&str>) -> Result<Account, AccountError> {
        let id = account_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_ACCOUNT_ID);

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AccountError::InvalidId(id.to_string()));
        }

        if id == DEFAULT_ACCOUNT_ID {
            if let Some(legacy) = &self.legacy_dir {
                return Ok(Account {
                    id: id.to_string(),
                    credential_dir: legacy.clone(),
                    is_legacy_layout: true,
                });
            }
        }

        Ok(Account {
            id: id.to_string(),
            credential_dir: self.root.join(id),
            is_legacy_layout: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_id_resolves_default() {
        let accounts = DirectoryAccounts::new("/data/creds");
        let account = accounts.resolve(None).unwrap();
        assert_eq!(account.id, "default");
        assert_eq!(account.credential_dir, PathBuf::from("/data/creds/default"));
        assert!(!account.is_legacy_layout);

        let blank = accounts.resolve(Some("  ")).unwrap();
        assert_eq!(blank.id, "default");
    }

    #[test]
    fn test_named_account() {
        let accounts = DirectoryAccounts::new("/data/creds");
        let account = accounts.resolve(Some("main")).unwrap();
        assert_eq!(account.credential_dir, PathBuf::from("/data/creds/main"));
    }

    #[test]
    fn test_legacy_dir_only_applies_to_default() {
        let accounts = DirectoryAccounts::new("/data/creds")
            .with_legacy_dir(Some(PathBuf::from("/data/legacy")));
        let default = accounts.resolve(None).unwrap();
        assert_eq!(default.credential_dir, PathBuf::from("/data/legacy"));
        assert!(default.is_legacy_layout);

        let other = accounts.resolve(Some("work")).unwrap();
        assert!(!other.is_legacy_layout);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let accounts = DirectoryAccounts::new("/data/creds");
        assert!(matches!(
            accounts.resolve(Some("../etc")),
            Err(AccountError::InvalidId(_))
        ));
    }
}
