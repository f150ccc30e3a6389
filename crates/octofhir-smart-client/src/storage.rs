//! Session storage capability.
//!
//! The client persists its [`ClientState`] under the session key after the
//! authorization code exchange, after each token refresh and when a dead
//! session is cleared. The pointer to the active session lives under
//! [`SMART_KEY`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::SmartResult;
use crate::error::SmartError;
use crate::state::ClientState;

/// Storage key holding the key of the active session.
pub const SMART_KEY: &str = "SMART_KEY";

/// Key-value storage for session data.
///
/// Implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads a value. Returns `None` when the key is absent.
    async fn get(&self, key: &str) -> SmartResult<Option<Value>>;

    /// Stores a value and returns it.
    async fn set(&self, key: &str, value: Value) -> SmartResult<Value>;

    /// Removes a value. Returns `true` if something was removed.
    async fn unset(&self, key: &str) -> SmartResult<bool>;
}

/// Shared storage handle.
pub type DynStorage = Arc<dyn Storage>;

/// In-process [`Storage`] backed by a concurrent map.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: Arc<DashMap<String, Value>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> SmartResult<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> SmartResult<Value> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(value)
    }

    async fn unset(&self, key: &str) -> SmartResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// Writes `state` under `key`.
pub(crate) async fn save_state(
    storage: &dyn Storage,
    key: &str,
    state: &ClientState,
) -> SmartResult<()> {
    let value = serde_json::to_value(state).map_err(|e| SmartError::storage(e.to_string()))?;
    storage.set(key, value).await?;
    Ok(())
}

/// Reads the state stored under `key`.
pub(crate) async fn load_state(
    storage: &dyn Storage,
    key: &str,
) -> SmartResult<Option<ClientState>> {
    match storage.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SmartError::storage(format!("Corrupt session state under {key}: {e}"))),
        None => Ok(None),
    }
}
