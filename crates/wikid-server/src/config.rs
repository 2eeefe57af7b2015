use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wikid_session::SessionConfig;
use wikid_store::ListConfig;

use crate::error::{ServerError, ServerResult};

/// Largest accepted tiddler PUT body: 8 MiB.
pub const DEFAULT_TIDDLER_SIZE_LIMIT: usize = 8 * 1024 * 1024;
/// Largest accepted upload body: 256 MiB.
pub const DEFAULT_UPLOAD_SIZE_LIMIT: usize = 256 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Recipe and bag name served under `/recipes/{recipe}` and `/bags/{recipe}`.
    pub recipe: String,
    /// TiddlyWiki HTML served at `/`.
    pub index_path: PathBuf,
    /// Upload directory, served under `/files`.
    pub files_dir: PathBuf,
    /// Store `$:/StoryList` and `$:/HistoryList` instead of skipping them.
    pub sync_story_list: bool,
    pub tiddler_size_limit: usize,
    pub upload_size_limit: usize,
    /// Minimum time a login attempt takes, in milliseconds.
    pub login_delay_ms: u64,
    pub store: StoreConfig,
    pub list: ListConfig,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            recipe: "default".into(),
            index_path: PathBuf::from("index.html"),
            files_dir: PathBuf::from("files"),
            sync_story_list: false,
            tiddler_size_limit: DEFAULT_TIDDLER_SIZE_LIMIT,
            upload_size_limit: DEFAULT_UPLOAD_SIZE_LIMIT,
            login_delay_ms: 500,
            store: StoreConfig::default(),
            list: ListConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml(text: &str) -> ServerResult<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Read a TOML config file.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }
}

/// Which record store backend to open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-memory records, optionally saved to a JSON snapshot on shutdown.
    Memory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot_path: Option<PathBuf>,
    },
    /// Records in a `sled` database directory.
    Sled { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory {
            snapshot_path: Some(PathBuf::from("store.json")),
        }
    }
}
