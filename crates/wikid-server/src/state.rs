use std::sync::Arc;

use wikid_session::{Clock, MemorySessionStore};
use wikid_store::{StoreResult, TiddlerStore};

use crate::auth::AuthProvider;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Shared handles every request handler sees.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TiddlerStore>,
    pub sessions: Arc<MemorySessionStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub config: Arc<ServerConfig>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TiddlerStore>,
        sessions: Arc<MemorySessionStore>,
        auth: Arc<dyn AuthProvider>,
        config: ServerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sessions,
            auth,
            config: Arc::new(config),
            clock,
        }
    }

    /// Run store work on the blocking pool. Every store call from a handler
    /// goes through here, since backends do synchronous disk I/O under
    /// std locks.
    pub async fn with_store<T, F>(&self, op: F) -> ServerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TiddlerStore) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(result?)
    }
}
