use serde::{Deserialize, Serialize};

/// Longest honoured TTL: ten years.
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Session lifetime and reaper settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle lifetime of a session, in seconds.
    pub ttl_secs: u64,
    /// How often the reaper sweeps expired sessions, in milliseconds.
    pub reap_interval_ms: u64,
    /// Token draws before session creation gives up.
    pub max_token_attempts: u32,
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.min(MAX_TTL_SECS) as i64)
    }

    pub fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 15 * 60,
            reap_interval_ms: 30_000,
            max_token_attempts: 10_000,
        }
    }
}
