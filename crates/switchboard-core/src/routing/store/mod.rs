//! Persistent storage for bandit arm state
//!
//! The bandit engine is a write-through cache; a [`BanditStore`] is the source
//! of truth across restarts. Three interchangeable variants exist:
//!
//! - [`MemoryBanditStore`]: process-local map, for tests and ephemeral runs
//! - [`KeyValueBanditStore`]: JSON values under `{prefix}{context}:{backendId}`
//! - [`SqliteBanditStore`]: a `bandit_state` table keyed by (backendId, context)

mod kv;
mod sqlite;

pub use kv::{DEFAULT_KEY_PREFIX, InMemoryKeyValue, KeyValueBanditStore, KeyValueClient, RedisClient};
pub use sqlite::{CREATE_BANDIT_STATE_TABLE_SQL, SqliteBanditStore, StoreSummary};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::types::{ArmKey, BanditArmState};
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Error, Result};

/// Async persistence contract for bandit arms
///
/// `save` is an upsert: last write wins on `(backend_id, context)`. `load` on
/// a missing key returns `Ok(None)`.
#[async_trait]
pub trait BanditStore: Send + Sync {
    /// Load one arm
    async fn load(&self, backend_id: &str, context: &str) -> Result<Option<BanditArmState>>;

    /// Insert or replace one arm
    async fn save(&self, backend_id: &str, context: &str, state: &BanditArmState) -> Result<()>;

    /// Load every arm, keyed by `context:backendId`
    async fn load_all(&self) -> Result<HashMap<String, BanditArmState>>;

    /// Save many arms keyed by `context:backendId`
    async fn save_all(&self, states: &[(String, BanditArmState)]) -> Result<()> {
        for (key, state) in states {
            let key = ArmKey::parse(key);
            self.save(&key.backend_id, &key.context, state).await?;
        }
        Ok(())
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryBanditStore {
    arms: RwLock<HashMap<ArmKey, BanditArmState>>,
}

impl MemoryBanditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored arms
    pub async fn len(&self) -> usize {
        self.arms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.arms.read().await.is_empty()
    }
}

#[async_trait]
impl BanditStore for MemoryBanditStore {
    async fn load(&self, backend_id: &str, context: &str) -> Result<Option<BanditArmState>> {
        Ok(self
            .arms
            .read()
            .await
            .get(&ArmKey::new(context, backend_id))
            .copied())
    }

    async fn save(&self, backend_id: &str, context: &str, state: &BanditArmState) -> Result<()> {
        self.arms
            .write()
            .await
            .insert(ArmKey::new(context, backend_id), *state);
        Ok(())
    }

    async fn load_all(&self) -> Result<HashMap<String, BanditArmState>> {
        Ok(self
            .arms
            .read()
            .await
            .iter()
            .map(|(key, state)| (key.storage_key(), *state))
            .collect())
    }
}

impl StoreConfig {
    /// Open the bandit store this configuration selects
    pub async fn open(&self) -> Result<Arc<dyn BanditStore>> {
        open_store(self).await
    }
}

/// Open the store selected by configuration
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn BanditStore>> {
    let store: Arc<dyn BanditStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryBanditStore::new()),
        StoreBackend::Sqlite => {
            let path = config.sqlite_path.clone().ok_or_else(|| {
                Error::ConfigError("store.sqlite_path is required for the sqlite store".to_string())
            })?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteBanditStore::connect(&path).await?;
            store.init().await?;
            Arc::new(store)
        }
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                Error::ConfigError("store.redis_url is required for the redis store".to_string())
            })?;
            let client = RedisClient::connect(url).await?;
            Arc::new(KeyValueBanditStore::new(client).with_prefix(config.key_prefix.clone()))
        }
    };

    info!(backend = %config.backend, "Opened bandit store");
    Ok(store)
}
