//! Backing key-value store contract and an in-memory implementation.
//!
//! Only the two point primitives the loaders need are part of the contract.
//! `hash_get_all_many` is the batch form a loader calls once per dispatch; the
//! default issues the point lookups concurrently and fails as a whole if any
//! of them fails.

use crate::{IrlError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait KvStore: Send + Sync {
    /// All fields of the hash at `key`; an empty map when the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Inclusive range of the list at `key`, in insertion order.
    async fn list_range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>>;

    /// Batch form of `hash_get_all`, results in `keys` order.
    async fn hash_get_all_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>> {
        futures::future::try_join_all(keys.iter().map(|k| self.hash_get_all(k))).await
    }
}

/// Seed document accepted by [`InMemoryKvStore::from_seed_file`].
#[derive(Debug, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub hashes: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub lists: HashMap<String, Vec<String>>,
}

/// In-memory store on concurrent maps. Suitable for development and testing.
#[derive(Default)]
pub struct InMemoryKvStore {
    hashes: DashMap<String, HashMap<String, String>>,
    lists: DashMap<String, Vec<String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn from_seed(seed: StoreSeed) -> Arc<Self> {
        let store = Self::default();
        for (key, fields) in seed.hashes {
            store.hashes.insert(key, fields);
        }
        for (key, items) in seed.lists {
            store.lists.insert(key, items);
        }
        info!(
            hashes = store.hashes.len(),
            lists = store.lists.len(),
            "In-memory store seeded"
        );
        Arc::new(store)
    }

    pub fn from_seed_file<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let raw = std::fs::read_to_string(path)?;
        let seed: StoreSeed = serde_json::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    /// Set one field of a hash, creating the hash if needed.
    pub fn hset(&self, key: &str, field: &str, value: impl Into<String>) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// Append to the tail of a list.
    pub fn rpush(&self, key: &str, value: impl Into<String>) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push(value.into());
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        debug!(key, "hash_get_all");
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }

    async fn list_range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
        debug!(key, start, end, "list_range");
        let Some(list) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        // negative indexes count from the tail
        let norm = |i: i64| if i < 0 { len + i } else { i };
        let (start, end) = (norm(start).max(0), norm(end).min(len - 1));
        if start > end || len == 0 {
            return Ok(Vec::new());
        }
        let range = usize::try_from(start)
            .and_then(|s| usize::try_from(end).map(|e| s..=e))
            .map_err(|e| IrlError::StoreUnavailable(format!("bad range for {key}: {e}")))?;
        Ok(list[range].to_vec())
    }
}
