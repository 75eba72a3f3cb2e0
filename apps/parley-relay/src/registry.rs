use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::storage::CredentialStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("this account is already logged in elsewhere")]
    SessionConflict,
}

#[derive(Debug)]
struct Session {
    connection_token: String,
    established_at: Instant,
}

/// Enforces at most one live session per handle.
///
/// All mutation goes through a single `Mutex` (see `SharedRegistry`), so an
/// authenticate racing a release for the same handle is serialized. Expired
/// sessions are purged lazily on every operation and independently by the
/// sweeper task.
pub struct SessionRegistry {
    credentials: CredentialStore,
    sessions: HashMap<String, Session>,
    ttl: Duration,
}

pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

impl SessionRegistry {
    pub fn new(credentials: CredentialStore, ttl: Duration) -> Self {
        Self {
            credentials,
            sessions: HashMap::new(),
            ttl,
        }
    }

    pub fn signup(&mut self, handle: &str, secret: &str) -> Result<(), crate::storage::StorageError> {
        self.credentials.add_user(handle, secret)
    }

    pub fn authenticate(
        &mut self,
        handle: &str,
        secret: &str,
        connection_token: &str,
    ) -> Result<(), AuthError> {
        self.authenticate_at(handle, secret, connection_token, Instant::now())
    }

    pub fn release(&mut self, handle: &str, connection_token: &str) -> bool {
        self.release_at(handle, connection_token, Instant::now())
    }

    fn authenticate_at(
        &mut self,
        handle: &str,
        secret: &str,
        connection_token: &str,
        now: Instant,
    ) -> Result<(), AuthError> {
        self.purge_expired(now);

        if !self.credentials.verify(handle, secret) {
            return Err(AuthError::InvalidCredentials);
        }
        if self.sessions.contains_key(handle) {
            return Err(AuthError::SessionConflict);
        }

        self.sessions.insert(
            handle.to_string(),
            Session {
                connection_token: connection_token.to_string(),
                established_at: now,
            },
        );
        info!(handle, "session established");
        Ok(())
    }

    /// Removes the session only if the token matches the one it was bound to.
    /// A stale or foreign token is a no-op, so one client cannot evict
    /// another's session by guessing the handle.
    fn release_at(&mut self, handle: &str, connection_token: &str, now: Instant) -> bool {
        self.purge_expired(now);

        match self.sessions.get(handle) {
            Some(session) if session.connection_token == connection_token => {
                self.sessions.remove(handle);
                info!(handle, "session released");
                true
            }
            _ => false,
        }
    }

    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.saturating_duration_since(session.established_at) <= ttl);
        let purged = before - self.sessions.len();
        if purged > 0 {
            debug!(purged, "expired sessions purged");
        }
        purged
    }
}

/// Periodic sweep so abandoned sessions free their handles even with no
/// authentication traffic.
pub fn spawn_sweeper(registry: SharedRegistry, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            registry.lock().await.purge_expired(Instant::now());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(users: &[(&str, &str)]) -> SessionRegistry {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store =
            CredentialStore::open(dir.path().join("users.json")).expect("open store");
        for (handle, secret) in users {
            store.add_user(handle, secret).expect("add user");
        }
        // keep the tempdir alive for the test duration by leaking it; the
        // store never touches the file again unless a signup happens
        std::mem::forget(dir);
        SessionRegistry::new(store, Duration::from_secs(86_400))
    }

    #[test]
    fn second_login_conflicts() {
        let mut registry = registry_with(&[("alice", "hunter2")]);
        assert_eq!(registry.authenticate("alice", "hunter2", "tab-1"), Ok(()));
        assert_eq!(
            registry.authenticate("alice", "hunter2", "tab-2"),
            Err(AuthError::SessionConflict)
        );
    }

    #[test]
    fn wrong_secret_is_invalid_regardless_of_session_state() {
        let mut registry = registry_with(&[("alice", "hunter2")]);
        assert_eq!(
            registry.authenticate("alice", "wrong", "tab-1"),
            Err(AuthError::InvalidCredentials)
        );
        registry
            .authenticate("alice", "hunter2", "tab-1")
            .expect("login");
        // still invalid credentials, not conflict
        assert_eq!(
            registry.authenticate("alice", "wrong", "tab-2"),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn foreign_token_release_is_a_noop() {
        let mut registry = registry_with(&[("alice", "hunter2")]);
        registry
            .authenticate("alice", "hunter2", "tab-1")
            .expect("login");
        assert!(!registry.release("alice", "tab-2"));
        assert_eq!(
            registry.authenticate("alice", "hunter2", "tab-3"),
            Err(AuthError::SessionConflict)
        );
    }

    #[test]
    fn matching_token_release_frees_the_handle() {
        let mut registry = registry_with(&[("alice", "hunter2")]);
        registry
            .authenticate("alice", "hunter2", "tab-1")
            .expect("login");
        assert!(registry.release("alice", "tab-1"));
        assert_eq!(registry.authenticate("alice", "hunter2", "tab-2"), Ok(()));
    }

    #[test]
    fn release_is_idempotent() {
        let mut registry = registry_with(&[("alice", "hunter2")]);
        registry
            .authenticate("alice", "hunter2", "tab-1")
            .expect("login");
        assert!(registry.release("alice", "tab-1"));
        assert!(!registry.release("alice", "tab-1"));
    }

    #[test]
    fn expired_session_frees_the_handle() {
        let mut registry = registry_with(&[("alice", "hunter2")]);
        let start = Instant::now();
        registry
            .authenticate_at("alice", "hunter2", "tab-1", start)
            .expect("login");
        let later = start + Duration::from_secs(86_401);
        assert_eq!(
            registry.authenticate_at("alice", "hunter2", "tab-2", later),
            Ok(())
        );
    }

    #[test]
    fn sweep_purges_only_expired_sessions() {
        let mut registry = registry_with(&[("alice", "a-secret"), ("bob", "b-secret")]);
        let start = Instant::now();
        registry
            .authenticate_at("alice", "a-secret", "tab-1", start)
            .expect("login alice");
        registry
            .authenticate_at("bob", "b-secret", "tab-2", start + Duration::from_secs(80_000))
            .expect("login bob");
        let purged = registry.purge_expired(start + Duration::from_secs(86_401));
        assert_eq!(purged, 1);
        assert_eq!(
            registry.authenticate_at("bob", "b-secret", "tab-3", start + Duration::from_secs(86_401)),
            Err(AuthError::SessionConflict)
        );
    }
}
