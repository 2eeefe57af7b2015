use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::Session;
use crate::token::{RandomTokens, TokenSource};

/// In-memory session table with an optional background reaper.
///
/// The token table is behind a `RwLock`; each [`Session`] carries its own
/// locks. Lookups renew, expired lookups evict, and the reaper sweeps
/// sessions nobody looks up any more.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    clock: Arc<dyn Clock>,
    tokens: Box<dyn TokenSource>,
    config: SessionConfig,
    shutdown: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySessionStore {
    /// Create a store without a reaper.
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
            tokens: Box::new(RandomTokens::default()),
            config,
            shutdown,
            reaper: Mutex::new(None),
        }
    }

    /// Replace the token generator.
    pub fn with_token_source(mut self, tokens: impl TokenSource + 'static) -> Self {
        self.tokens = Box::new(tokens);
        self
    }

    /// Create a store and start its reaper on the current tokio runtime.
    pub fn spawn(config: SessionConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let store = Arc::new(Self::new(config, clock));
        store.start_reaper();
        store
    }

    /// Start the reaper task. It holds only a weak reference, so dropping
    /// the last `Arc` also ends the task.
    pub fn start_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.is_closed() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.reap_interval();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else {
                            break;
                        };
                        let removed = store.sweep_expired();
                        if removed > 0 {
                            debug!(removed, remaining = store.len(), "reaped expired sessions");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("session reaper stopped");
        }));
        info!(interval_ms = self.config.reap_interval_ms, "session reaper started");
    }

    /// Create a session under a fresh random token.
    ///
    /// Gives up with [`SessionError::TokenSpaceExhausted`] after
    /// `max_token_attempts` colliding draws.
    pub fn new_token(&self) -> SessionResult<(String, Arc<Session>)> {
        let session = Arc::new(Session::new(self.clock.now() + self.config.ttl()));
        let attempts = self.config.max_token_attempts;

        let mut sessions = self.write();
        for _ in 0..attempts {
            if let Entry::Vacant(slot) = sessions.entry(self.tokens.token()) {
                let token = slot.key().clone();
                slot.insert(Arc::clone(&session));
                return Ok((token, session));
            }
        }
        Err(SessionError::TokenSpaceExhausted { attempts })
    }

    /// Create a session under a caller-chosen token. An existing session
    /// under that token is returned unchanged.
    pub fn insert_with_token(&self, token: &str) -> Arc<Session> {
        let fresh = Session::new(self.clock.now() + self.config.ttl());
        let mut sessions = self.write();
        Arc::clone(
            sessions
                .entry(token.to_string())
                .or_insert_with(|| Arc::new(fresh)),
        )
    }

    /// Look up a live session and extend its expiry. Expired sessions are
    /// evicted and reported as absent.
    ///
    /// Renewal happens under the table's read lock, so a concurrent sweep
    /// either removes the session first or sees the renewed expiry.
    pub fn get_or_renew(&self, token: &str) -> Option<Arc<Session>> {
        let session = {
            let sessions = self.read();
            let session = sessions.get(token)?;
            let now = self.clock.now();
            if !session.is_expired(now) {
                session.renew(now, self.config.ttl());
                return Some(Arc::clone(session));
            }
            Arc::clone(session)
        };

        let now = self.clock.now();
        let mut sessions = self.write();
        if let Some(current) = sessions.get(token) {
            if Arc::ptr_eq(current, &session) && current.is_expired(now) {
                sessions.remove(token);
            }
        }
        debug!("evicted expired session on lookup");
        None
    }

    /// Remove a session. Returns whether it existed.
    pub fn destroy(&self, token: &str) -> bool {
        self.write().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(t, _)| t.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut sessions = self.write();
        let mut removed = 0;
        for token in expired {
            // A renewal may have landed between the two locks.
            if sessions.get(&token).is_some_and(|s| s.is_expired(now)) {
                sessions.remove(&token);
                removed += 1;
            }
        }
        removed
    }

    /// Stop the reaper. Safe to call more than once.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("session store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop the reaper and wait for its task to finish.
    pub async fn shutdown(&self) {
        self.close();
        let handle = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemorySessionStore {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for MemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySessionStore")
            .field("sessions", &self.len())
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemorySessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemorySessionStore::new(SessionConfig::default(), clock.clone());
        (store, clock)
    }

    struct Constant;

    impl TokenSource for Constant {
        fn token(&self) -> String {
            "same".to_string()
        }
    }

    #[test]
    fn new_token_creates_live_session() {
        let (store, clock) = store_with_clock();
        let (token, session) = store.new_token().unwrap();
        assert_eq!(token.len(), 36);
        assert_eq!(session.expires_at(), clock.now() + Duration::minutes(15));
        let found = store.get_or_renew(&token).unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn values_are_shared_through_lookups() {
        let (store, _) = store_with_clock();
        let (token, session) = store.new_token().unwrap();
        session.set("acc", "alice");
        let found = store.get_or_renew(&token).unwrap();
        assert_eq!(found.get_str("acc").as_deref(), Some("alice"));
    }

    #[test]
    fn expired_lookup_evicts() {
        let (store, clock) = store_with_clock();
        let (token, _) = store.new_token().unwrap();
        clock.advance(Duration::minutes(16));
        assert!(store.get_or_renew(&token).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn lookup_renews_expiry() {
        let (store, clock) = store_with_clock();
        let (token, session) = store.new_token().unwrap();
        clock.advance(Duration::minutes(10));
        assert!(store.get_or_renew(&token).is_some());
        assert_eq!(session.expires_at(), clock.now() + Duration::minutes(15));
        clock.advance(Duration::minutes(10));
        assert!(store.get_or_renew(&token).is_some());
    }

    #[test]
    fn unknown_token_is_absent() {
        let (store, _) = store_with_clock();
        assert!(store.get_or_renew("nope").is_none());
    }

    #[test]
    fn destroy_is_unconditional() {
        let (store, _) = store_with_clock();
        let (token, _) = store.new_token().unwrap();
        assert!(store.destroy(&token));
        assert!(!store.destroy(&token));
        assert!(!store.destroy("never-existed"));
        assert!(store.get_or_renew(&token).is_none());
    }

    #[test]
    fn insert_with_token_keeps_existing() {
        let (store, _) = store_with_clock();
        let first = store.insert_with_token("fixed");
        first.set("k", "v");
        let second = store.insert_with_token("fixed");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn exhausted_token_space_fails() {
        let clock = Arc::new(ManualClock::default());
        let config = SessionConfig {
            max_token_attempts: 5,
            ..SessionConfig::default()
        };
        let store = MemorySessionStore::new(config, clock).with_token_source(Constant);
        assert_eq!(store.new_token().unwrap().0, "same");
        let err = store.new_token().unwrap_err();
        assert!(matches!(err, SessionError::TokenSpaceExhausted { attempts: 5 }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (store, clock) = store_with_clock();
        let (old, _) = store.new_token().unwrap();
        clock.advance(Duration::minutes(10));
        let (fresh, _) = store.new_token().unwrap();
        clock.advance(Duration::minutes(6));

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get_or_renew(&old).is_none());
        assert!(store.get_or_renew(&fresh).is_some());
        assert_eq!(store.sweep_expired(), 0);
    }

    #[test]
    fn renewal_never_returns_swept_session() {
        for i in 0..200 {
            let (store, clock) = store_with_clock();
            let token = format!("t{i}");
            let session = store.insert_with_token(&token);
            clock.set(session.expires_at());

            let found = std::thread::scope(|s| {
                let lookup = s.spawn(|| store.get_or_renew(&token));
                s.spawn(|| {
                    clock.advance(Duration::seconds(1));
                    store.sweep_expired();
                });
                lookup.join().unwrap()
            });
            if found.is_some() {
                assert!(store.read().contains_key(&token), "iteration {i}");
            }
        }
    }

    #[test]
    fn concurrent_new_token_200() {
        let (store, _) = store_with_clock();
        let tokens: HashSet<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..200)
                .map(|_| s.spawn(|| store.new_token().unwrap().0))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(tokens.len(), 200);
        assert_eq!(store.len(), 200);
    }

    #[test]
    fn concurrent_new_token_1000() {
        let (store, _) = store_with_clock();
        let tokens: HashSet<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..125)
                            .map(|_| store.new_token().unwrap().0)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(tokens.len(), 1000);
        assert_eq!(store.len(), 1000);
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            reap_interval_ms: 10,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn reaper_removes_abandoned_sessions() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemorySessionStore::spawn(fast_config(), clock.clone());
        store.new_token().unwrap();
        store.new_token().unwrap();
        clock.advance(Duration::minutes(20));

        for _ in 0..200 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(store.is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_reaping() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemorySessionStore::spawn(fast_config(), clock.clone());
        store.close();
        store.close();
        assert!(store.is_closed());
        store.shutdown().await;

        store.new_token().unwrap();
        clock.advance(Duration::minutes(20));
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(store.len(), 1);

        // Restarting after close is refused.
        store.start_reaper();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn reaper_ends_when_store_is_dropped() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemorySessionStore::spawn(fast_config(), clock);
        let weak = Arc::downgrade(&store);
        drop(store);
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert!(weak.upgrade().is_none());
    }
}
