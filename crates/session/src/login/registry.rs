use std::sync::Arc;

use dashmap::DashMap;

use super::attempt::LoginAttempt;

/// In-flight login attempts, keyed by account id.
///
/// Owned by whoever hosts the coordinator; clones share the same map.
#[derive(Clone, Default)]
pub struct LoginRegistry {
    attempts: Arc<DashMap<String, Arc<LoginAttempt>>>,
}

impl LoginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `attempt`, returning whatever it displaced.
    pub fn insert(&self, attempt: Arc<LoginAttempt>) -> Option<Arc<LoginAttempt>> {
        self.attempts.insert(attempt.account().id.clone(), attempt)
    }

    pub fn get(&self, account_id: &str) -> Option<Arc<LoginAttempt>> {
        self.attempts.get(account_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, account_id: &str) -> Option<Arc<LoginAttempt>> {
        self.attempts.remove(account_id).map(|(_, attempt)| attempt)
    }

    /// Remove the entry only if it is still `attempt`.
    pub fn remove_if_same(&self, attempt: &LoginAttempt) -> bool {
        self.attempts
            .remove_if(&attempt.account().id, |_, current| current.id() == attempt.id())
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::factory::ConnectionControl;
    use crate::transport::SocketControl;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct NullSocket;

    impl SocketControl for NullSocket {
        fn close(&self) {}
    }

    fn attempt(account_id: &str) -> Arc<LoginAttempt> {
        let account = Account {
            id: account_id.into(),
            credential_dir: PathBuf::from("/tmp").join(account_id),
            is_legacy_layout: false,
        };
        let control = ConnectionControl::new(Uuid::new_v4(), Arc::new(NullSocket));
        Arc::new(LoginAttempt::new(account, false, control))
    }

    #[test]
    fn test_insert_displaces_previous() {
        let registry = LoginRegistry::new();
        let first = attempt("main");
        assert!(registry.insert(first.clone()).is_none());

        let second = attempt("main");
        let displaced = registry.insert(second.clone()).unwrap();
        assert_eq!(displaced.id(), first.id());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("main").unwrap().id(), second.id());
    }

    #[test]
    fn test_remove_if_same_ignores_stale_attempt() {
        let registry = LoginRegistry::new();
        let stale = attempt("main");
        let current = attempt("main");
        registry.insert(current.clone());

        assert!(!registry.remove_if_same(&stale));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if_same(&current));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registries_are_independent() {
        let a = LoginRegistry::new();
        let b = LoginRegistry::new();
        a.insert(attempt("main"));
        assert!(b.get("main").is_none());
        // Clones share state
        assert!(a.clone().get("main").is_some());
    }
}
