use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// One login session: a key/value bag plus an absolute expiry.
///
/// Expiry and values are locked separately from each other and from the
/// store's token table, so work on one session never blocks another.
#[derive(Debug)]
pub struct Session {
    expires_at: RwLock<DateTime<Utc>>,
    values: RwLock<HashMap<String, Value>>,
}

impl Session {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: RwLock::new(expires_at),
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expired once `now` is past the expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Push the expiry to `now + ttl`.
    pub fn renew(&self, now: DateTime<Utc>, ttl: Duration) {
        *self.expires_at.write().unwrap_or_else(PoisonError::into_inner) = now + ttl;
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// The value under `key` if it is a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Store a value, returning the one it replaced.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_session_has_no_values() {
        let s = Session::new(Utc::now());
        assert!(s.get("acc").is_none());
        assert!(!s.contains("acc"));
    }

    #[test]
    fn set_get_remove() {
        let s = Session::new(Utc::now());
        assert_eq!(s.set("acc", "alice"), None);
        assert_eq!(s.get_str("acc").as_deref(), Some("alice"));
        assert_eq!(s.set("acc", "bob"), Some(Value::from("alice")));
        s.set("count", 3);
        assert_eq!(s.get("count"), Some(Value::from(3)));
        assert!(s.get_str("count").is_none());
        assert_eq!(s.remove("acc"), Some(Value::from("bob")));
        assert!(s.get("acc").is_none());
    }

    #[test]
    fn expiry_is_strictly_after() {
        let now = Utc::now();
        let s = Session::new(now);
        assert!(!s.is_expired(now));
        assert!(s.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn renew_moves_expiry_forward() {
        let now = Utc::now();
        let s = Session::new(now);
        s.renew(now + Duration::minutes(10), Duration::minutes(15));
        assert_eq!(s.expires_at(), now + Duration::minutes(25));
        assert!(!s.is_expired(now + Duration::minutes(20)));
    }
}
