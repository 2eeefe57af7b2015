use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use wikid_session::{Clock, MemorySessionStore, SystemClock};
use wikid_store::{ListConfig, MemoryTiddlerStore, SledTiddlerStore, TiddlerStore};

use crate::auth::{AllowAllAuth, AuthProvider};
use crate::config::{ServerConfig, StoreConfig};
use crate::error::{ServerError, ServerResult};
use crate::router::build_router;
use crate::state::AppState;

/// Open the record store `config` names.
pub fn open_store(config: &StoreConfig, list: ListConfig) -> ServerResult<Arc<dyn TiddlerStore>> {
    let store: Arc<dyn TiddlerStore> = match config {
        StoreConfig::Memory { snapshot_path: None } => {
            Arc::new(MemoryTiddlerStore::with_config(list))
        }
        StoreConfig::Memory {
            snapshot_path: Some(path),
        } => Arc::new(MemoryTiddlerStore::open_snapshot(path.clone(), list)?),
        StoreConfig::Sled { path } => Arc::new(SledTiddlerStore::open_sled(path, list)?),
    };
    info!(records = store.len()?, "opened tiddler store");
    Ok(store)
}

/// wikid HTTP server.
pub struct WikiServer {
    state: AppState,
}

impl WikiServer {
    /// Open the configured store and start the session reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let store = open_store(&config.store, config.list.clone())?;
        Ok(Self::with_parts(store, Arc::new(AllowAllAuth), Arc::new(SystemClock), config))
    }

    /// Assemble a server from already-built parts.
    pub fn with_parts(
        store: Arc<dyn TiddlerStore>,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
        config: ServerConfig,
    ) -> Self {
        let sessions = MemorySessionStore::spawn(config.session.clone(), Arc::clone(&clock));
        Self {
            state: AppState::new(store, sessions, auth, config, clock),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    /// Serve until `shutdown` resolves, then stop the session reaper and
    /// flush the store.
    pub async fn serve<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config.bind_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "wikid listening");

        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        info!("shutting down");
        self.state.sessions.shutdown().await;
        self.state.with_store(|store| store.flush()).await
    }
}
