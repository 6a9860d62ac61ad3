//! Per-scope batching and caching over an async multi-key lookup.
//!
//! A `KeyedBatchLoader` lives for one logical scope (one query or mutation
//! execution). Every `load` issued before the first caller of a batch reaches
//! its next suspension point lands in the same batch; duplicate keys collapse
//! onto one cache slot. The batch is then handed to the `BatchFn` in a single
//! call and each slot is resolved from the returned map, absent keys resolving
//! to `None`.
//!
//! Slots are write-once for the loader's lifetime. Failed slots are evicted
//! after every waiter has been told, so a later load in the same scope issues
//! a fresh lookup instead of replaying the failure. A `BatchFn` that panics
//! counts as a failed batch.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::IrlError;

/// Failure shared by every caller coalesced into one batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LoadError(Arc<str>);

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(Arc::from(message.into()))
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<IrlError> for LoadError {
    fn from(err: IrlError) -> Self {
        LoadError::new(err.to_string())
    }
}

/// Multi-key lookup backing a loader. Keys missing from the returned map are
/// treated as not found.
#[async_trait]
pub trait BatchFn<K, V>: Send + Sync + 'static {
    async fn load(&self, keys: &[K]) -> crate::Result<HashMap<K, V>>;
}

type Outcome<V> = std::result::Result<Option<V>, LoadError>;
type Slot<V> = watch::Sender<Option<Outcome<V>>>;

struct State<K, V> {
    cache: HashMap<K, Slot<V>>,
    // keys waiting for the next dispatch, in first-request order
    pending: Vec<K>,
}

struct Inner<K, V> {
    name: &'static str,
    batch_fn: Arc<dyn BatchFn<K, V>>,
    fetch_timeout: Option<Duration>,
    state: Mutex<State<K, V>>,
}

/// Batching, deduplicating, per-scope caching loader.
pub struct KeyedBatchLoader<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for KeyedBatchLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> KeyedBatchLoader<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, batch_fn: Arc<dyn BatchFn<K, V>>) -> Self {
        Self::build(name, batch_fn, None)
    }

    /// Bound every batch call; an expired call fails the whole batch.
    pub fn with_timeout(name: &'static str, batch_fn: Arc<dyn BatchFn<K, V>>, limit: Duration) -> Self {
        Self::build(name, batch_fn, Some(limit))
    }

    fn build(name: &'static str, batch_fn: Arc<dyn BatchFn<K, V>>, fetch_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                batch_fn,
                fetch_timeout,
                state: Mutex::new(State {
                    cache: HashMap::new(),
                    pending: Vec::new(),
                }),
            }),
        }
    }

    /// Load one key. `Ok(None)` means the backing lookup had no value for it.
    pub async fn load(&self, key: K) -> std::result::Result<Option<V>, LoadError> {
        let (mut rx, leader) = {
            let mut state = self.inner.lock_state();
            if let Some(slot) = state.cache.get(&key) {
                debug!(loader = self.inner.name, key = ?key, "loader cache hit");
                (slot.subscribe(), false)
            } else {
                let (tx, rx) = watch::channel(None);
                state.cache.insert(key.clone(), tx);
                state.pending.push(key);
                (rx, state.pending.len() == 1)
            }
        };

        if leader {
            // Dispatch runs when the guard drops, so a cancelled leader still
            // flushes the batch the other callers are waiting on.
            let _flush = FlushGuard {
                inner: Arc::clone(&self.inner),
            };
            tokio::task::yield_now().await;
        }

        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| LoadError::new(format!("{} batch dropped before resolving", self.inner.name)))?;
        match &*resolved {
            Some(outcome) => outcome.clone(),
            None => Err(LoadError::new("slot resolved without a value")),
        }
    }

    /// Load several keys; results come back in request order.
    pub async fn load_many(&self, keys: Vec<K>) -> Vec<std::result::Result<Option<V>, LoadError>> {
        futures::future::join_all(keys.into_iter().map(|k| self.load(k))).await
    }

    /// Seed the cache without a lookup. An existing slot is left untouched.
    pub fn prime(&self, key: K, value: Option<V>) {
        let mut state = self.inner.lock_state();
        state
            .cache
            .entry(key)
            .or_insert_with(|| watch::channel(Some(Ok(value))).0);
    }

    /// Number of keys this scope has asked for so far.
    pub fn cached_keys(&self) -> usize {
        self.inner.lock_state().cache.len()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(self: &Arc<Self>) {
        let keys = std::mem::take(&mut self.lock_state().pending);
        if keys.is_empty() {
            return;
        }
        // Issued calls run to completion even if every caller went away.
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.dispatch(keys).await });
    }

    #[tracing::instrument(skip(self, keys), fields(loader = self.name, batch_size = keys.len()))]
    async fn dispatch(&self, keys: Vec<K>) {
        debug!(keys = ?keys, "dispatching batch");
        let call = AssertUnwindSafe(async { self.batch_fn.load(&keys).await }).catch_unwind();
        let guarded = async {
            match call.await {
                Ok(r) => r.map_err(LoadError::from),
                Err(_) => Err(LoadError::new(format!(
                    "store unavailable: {} batch lookup panicked",
                    self.name
                ))),
            }
        };
        let result = match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded).await.unwrap_or_else(|_| {
                Err(LoadError::new(format!(
                    "store unavailable: {} batch exceeded {}ms",
                    self.name,
                    limit.as_millis()
                )))
            }),
            None => guarded.await,
        };

        let mut state = self.lock_state();
        match result {
            Ok(mut values) => {
                for key in keys {
                    if let Some(slot) = state.cache.get(&key) {
                        slot.send_replace(Some(Ok(values.remove(&key))));
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "batch lookup failed");
                for key in &keys {
                    if let Some(slot) = state.cache.remove(key) {
                        slot.send_replace(Some(Err(err.clone())));
                    }
                }
            }
        }
    }
}

struct FlushGuard<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Drop for FlushGuard<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.flush();
    }
}
