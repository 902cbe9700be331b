//! Opaque session tokens mapped to delegated credentials
//!
//! Sessions live in memory only and expire a fixed time after creation.
//! Expired entries are evicted lazily on lookup and by a periodic sweep task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::gmail::DelegatedCredentials;

/// Length of a session token: 48 random bytes, hex-encoded
pub const TOKEN_LEN: usize = 96;

/// Single session entry
#[derive(Debug, Clone)]
struct Session {
    credentials: DelegatedCredentials,
    created_at: Instant,
}

/// Lookup seam used by the authorization gateway
pub trait SessionResolver: Send + Sync {
    /// Credentials for a live session, `None` if unknown or expired
    fn resolve(&self, token: &str) -> Option<DelegatedCredentials>;
}

/// In-memory session store with fixed TTL
///
/// Safe to share across tasks behind an `Arc`. The lock is never held across
/// an await point.
#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, session: &Session, now: Instant) -> bool {
        now.saturating_duration_since(session.created_at) > self.ttl
    }

    /// Store credentials under a fresh random token and return the token
    pub fn create(&self, credentials: DelegatedCredentials) -> String {
        self.create_at(credentials, Instant::now())
    }

    /// Create a session as of `now`
    pub fn create_at(&self, credentials: DelegatedCredentials, now: Instant) -> String {
        let token = hex::encode(rand::rng().random::<[u8; 48]>());
        self.lock().insert(
            token.clone(),
            Session {
                credentials,
                created_at: now,
            },
        );
        debug!(active = self.len(), "session created");
        token
    }

    /// Resolve a token as of `now`, evicting it if it has expired
    pub fn resolve_at(&self, token: &str, now: Instant) -> Option<DelegatedCredentials> {
        let mut entries = self.lock();
        let session = entries.get(token)?;
        if self.is_expired(session, now) {
            entries.remove(token);
            return None;
        }
        Some(session.credentials.clone())
    }

    /// Drop a session; unknown tokens are ignored
    pub fn invalidate(&self, token: &str) {
        self.lock().remove(token);
    }

    /// Remove every expired session, returning how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, session| !self.is_expired(session, now));
        before - entries.len()
    }

    /// Number of stored sessions, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionResolver for SessionStore {
    fn resolve(&self, token: &str) -> Option<DelegatedCredentials> {
        self.resolve_at(token, Instant::now())
    }
}

/// Run [`SessionStore::sweep`] every `interval` until `cancel` fires
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = store.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = store.len(), "expired sessions swept");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use secrecy::ExposeSecret;
    use tokio_util::sync::CancellationToken;

    use super::{SessionResolver, SessionStore, TOKEN_LEN, spawn_sweeper};
    use crate::gmail::DelegatedCredentials;

    const TTL: Duration = Duration::from_secs(60);

    fn creds(token: &str) -> DelegatedCredentials {
        DelegatedCredentials::from_access_token(token)
    }

    #[test]
    fn create_returns_lowercase_hex_tokens_that_resolve() {
        let store = SessionStore::new(TTL);
        let token = store.create(creds("access-1"));

        assert_eq!(token.len(), TOKEN_LEN);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        );

        let resolved = store.resolve(&token).expect("session resolves");
        assert_eq!(resolved.access_token.expose_secret(), "access-1");
    }

    #[test]
    fn tokens_are_distinct() {
        let store = SessionStore::new(TTL);
        let a = store.create(creds("a"));
        let b = store.create(creds("b"));
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unknown_token_resolves_to_none() {
        let store = SessionStore::new(TTL);
        assert!(store.resolve(&"0".repeat(TOKEN_LEN)).is_none());
    }

    #[test]
    fn expired_session_is_evicted_on_lookup() {
        let store = SessionStore::new(TTL);
        let start = Instant::now();
        let token = store.create_at(creds("a"), start);

        assert!(store.resolve_at(&token, start + TTL).is_some());
        assert!(
            store
                .resolve_at(&token, start + TTL + Duration::from_millis(1))
                .is_none()
        );
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_sessions() {
        let store = SessionStore::new(TTL);
        let start = Instant::now();
        let old = store.create_at(creds("old"), start);
        let fresh = store.create_at(creds("fresh"), start + Duration::from_secs(30));

        let removed = store.sweep_at(start + Duration::from_secs(61));
        assert_eq!(removed, 1);
        assert!(store.resolve_at(&old, start + Duration::from_secs(61)).is_none());
        assert!(store.resolve_at(&fresh, start + Duration::from_secs(61)).is_some());
    }

    #[test]
    fn invalidate_is_idempotent() {
        let store = SessionStore::new(TTL);
        let token = store.create(creds("a"));
        store.invalidate(&token);
        store.invalidate(&token);
        store.invalidate("never-issued");
        assert!(store.resolve(&token).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let store = Arc::new(SessionStore::new(Duration::ZERO));
        store.create(creds("a"));
        std::thread::sleep(Duration::from_millis(2));

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(store.clone(), Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.is_empty());

        cancel.cancel();
        handle.await.expect("sweeper exits cleanly");
    }
}
