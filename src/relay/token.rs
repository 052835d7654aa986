//! Message tokens
//!
//! A token is written under a message id before a request is posted to a frame and
//! consumed by the receiver before it acts. Consumption is a single atomic
//! remove, so a duplicated delivery finds nothing and is rejected.

use crate::error::StorageError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Tree holding message tokens in the sled database.
pub const TOKEN_TREE: &str = "message_tokens";

/// Path value selecting the in-memory store.
pub const MEMORY_STORE: &str = "memory";

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Token database location. Unset uses the user data directory; `memory`
    /// keeps tokens in process.
    #[serde(default)]
    pub token_store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToken {
    pub id: String,
    pub created_at_ms: i64,
}

impl MessageToken {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Shared key-value store for message tokens.
pub trait TokenStore: Send + Sync {
    fn put(&self, id: &str) -> Result<(), StorageError>;

    fn contains(&self, id: &str) -> Result<bool, StorageError>;

    /// Atomically reads and deletes the token. `None` when it is absent.
    fn consume(&self, id: &str) -> Result<Option<MessageToken>, StorageError>;

    /// Drops tokens created more than `age` ago; returns how many were removed.
    fn purge_older_than(&self, age: Duration) -> Result<usize, StorageError>;

    fn len(&self) -> Result<usize, StorageError>;
}

fn cutoff(age: Duration) -> i64 {
    chrono::Utc::now().timestamp_millis() - age.as_millis() as i64
}

/// Sled-backed token store
pub struct SledTokenStore {
    tree: sled::Tree,
}

fn sled_error(context: &str, err: sled::Error) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", context, err),
    ))
}

impl SledTokenStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| sled_error("Failed to open sled database", e))?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db
            .open_tree(TOKEN_TREE)
            .map_err(|e| sled_error("Failed to open token tree", e))?;
        Ok(Self { tree })
    }

    fn decode(value: &[u8]) -> Result<MessageToken, StorageError> {
        serde_json::from_slice(value).map_err(|e| StorageError::InvalidRecord(e.to_string()))
    }
}

impl TokenStore for SledTokenStore {
    fn put(&self, id: &str) -> Result<(), StorageError> {
        let value = serde_json::to_vec(&MessageToken::new(id))
            .map_err(|e| StorageError::InvalidRecord(e.to_string()))?;
        self.tree
            .insert(id.as_bytes(), value)
            .map_err(|e| sled_error("Failed to write token", e))?;
        Ok(())
    }

    fn contains(&self, id: &str) -> Result<bool, StorageError> {
        self.tree
            .contains_key(id.as_bytes())
            .map_err(|e| sled_error("Failed to read token", e))
    }

    fn consume(&self, id: &str) -> Result<Option<MessageToken>, StorageError> {
        let removed = self
            .tree
            .remove(id.as_bytes())
            .map_err(|e| sled_error("Failed to consume token", e))?;
        removed.map(|value| Self::decode(&value)).transpose()
    }

    fn purge_older_than(&self, age: Duration) -> Result<usize, StorageError> {
        let cutoff = cutoff(age);
        let mut purged = 0;
        for entry in self.tree.iter() {
            let (key, value) = entry.map_err(|e| sled_error("Failed to scan tokens", e))?;
            let stale = match Self::decode(&value) {
                Ok(token) => token.created_at_ms < cutoff,
                Err(_) => true,
            };
            if stale
                && self
                    .tree
                    .remove(&key)
                    .map_err(|e| sled_error("Failed to purge token", e))?
                    .is_some()
            {
                purged += 1;
            }
        }
        if purged > 0 {
            self.tree
                .flush()
                .map_err(|e| sled_error("Failed to flush tokens", e))?;
        }
        Ok(purged)
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.tree.len())
    }
}

/// In-process token store
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, MessageToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn put(&self, id: &str) -> Result<(), StorageError> {
        self.tokens.lock().insert(id.to_string(), MessageToken::new(id));
        Ok(())
    }

    fn contains(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.tokens.lock().contains_key(id))
    }

    fn consume(&self, id: &str) -> Result<Option<MessageToken>, StorageError> {
        Ok(self.tokens.lock().remove(id))
    }

    fn purge_older_than(&self, age: Duration) -> Result<usize, StorageError> {
        let cutoff = cutoff(age);
        let mut tokens = self.tokens.lock();
        let before = tokens.len();
        tokens.retain(|_, token| token.created_at_ms >= cutoff);
        Ok(before - tokens.len())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.tokens.lock().len())
    }
}

/// Default token database location under the user data directory.
pub fn default_token_store_path() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("", "", "turium")
        .map(|dirs| dirs.data_dir().join("tokens"))
        .ok_or_else(|| StorageError::InvalidPath("no home directory for token store".to_string()))
}

/// Opens the token store selected by `config`.
pub fn open_token_store(config: &StorageConfig) -> Result<Arc<dyn TokenStore>, StorageError> {
    let path = match &config.token_store_path {
        Some(path) if path.as_os_str() == MEMORY_STORE => {
            debug!("Using in-memory token store");
            return Ok(Arc::new(MemoryTokenStore::new()));
        }
        Some(path) => path.clone(),
        None => default_token_store_path()?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(path = %path.display(), "Opening token store");
    Ok(Arc::new(SledTokenStore::open(&path)?))
}
