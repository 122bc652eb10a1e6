//! Key-value bandit store
//!
//! Each arm is a JSON string `{trials, rewardSum, alpha, beta}` stored under
//! `{prefix}{context}:{backendId}`. The wire client is abstracted behind
//! [`KeyValueClient`] so Redis can be swapped for any string key-value engine.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::BanditStore;
use crate::error::{Error, Result};
use crate::routing::types::{ArmKey, BanditArmState};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "bandit:";

/// Minimal string key-value capability
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Keys matching a glob pattern (only `prefix*` patterns are used)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Redis client over a reconnecting connection manager
#[derive(Clone)]
pub struct RedisClient {
    connection_manager: redis::aio::ConnectionManager,
}

impl RedisClient {
    /// Connect to `redis://...`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        info!("Connected to redis bandit store");
        Ok(Self { connection_manager })
    }
}

#[async_trait]
impl KeyValueClient for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection_manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        Ok(conn.keys(pattern).await?)
    }
}

/// In-process key-value client for tests and offline runs
#[derive(Debug, Default)]
pub struct InMemoryKeyValue {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a raw value, bypassing the store's serialization
    pub async fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().await.insert(key.into(), value.into());
    }
}

#[async_trait]
impl KeyValueClient for InMemoryKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let prefix = pattern.strip_suffix('*').ok_or_else(|| {
            Error::StoreError(format!("unsupported key pattern: {}", pattern))
        })?;
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Bandit store over any [`KeyValueClient`]
pub struct KeyValueBanditStore<C> {
    client: C,
    prefix: String,
}

impl<C: KeyValueClient> KeyValueBanditStore<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Set the key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Underlying client
    pub fn client(&self) -> &C {
        &self.client
    }

    fn key(&self, backend_id: &str, context: &str) -> String {
        format!("{}{}:{}", self.prefix, context, backend_id)
    }
}

#[async_trait]
impl<C: KeyValueClient> BanditStore for KeyValueBanditStore<C> {
    async fn load(&self, backend_id: &str, context: &str) -> Result<Option<BanditArmState>> {
        let key = self.key(backend_id, context);
        let Some(raw) = self.client.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring malformed bandit entry");
                Ok(None)
            }
        }
    }

    async fn save(&self, backend_id: &str, context: &str, state: &BanditArmState) -> Result<()> {
        let key = self.key(backend_id, context);
        self.client.set(&key, &serde_json::to_string(state)?).await?;
        debug!(key = %key, trials = state.trials, "Saved bandit arm");
        Ok(())
    }

    async fn load_all(&self) -> Result<HashMap<String, BanditArmState>> {
        let keys = self.client.keys(&format!("{}*", self.prefix)).await?;
        let mut result = HashMap::with_capacity(keys.len());

        for key in keys {
            let Some(rest) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let Some((context, backend_id)) = rest.split_once(':') else {
                warn!(key = %key, "Skipping bandit key without context separator");
                continue;
            };
            let Some(raw) = self.client.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<BanditArmState>(&raw) {
                Ok(state) => {
                    result.insert(ArmKey::new(context, backend_id).storage_key(), state);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping malformed bandit entry"),
            }
        }

        debug!(count = result.len(), "Loaded bandit arms from key-value store");
        Ok(result)
    }
}
