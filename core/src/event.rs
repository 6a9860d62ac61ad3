// Event bus implementation
//
// One topic per key, created on first subscribe and retired when its last
// subscriber detaches. Publishes and subscriber-set changes on a topic are
// serialised by the topic's lock, which is what keeps per-topic publish order
// and makes detachment effective for every publish that starts after it.
use crate::config::{Backpressure, MAX_SUBSCRIBER_CAPACITY};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a subscriber receives: a shared, read-only payload.
pub type Delivery<T> = Arc<T>;

/// Event bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub dropped_events: u64,
}

enum Outbound<T> {
    Queued(mpsc::Sender<Delivery<T>>),
    Lossy(broadcast::Sender<Delivery<T>>),
}

enum Inbound<T> {
    Queued(mpsc::Receiver<Delivery<T>>),
    Lossy(broadcast::Receiver<Delivery<T>>),
}

struct Subscriber<T> {
    id: u64,
    outbound: Outbound<T>,
    detached: CancellationToken,
}

struct TopicState<T> {
    subscribers: Vec<Subscriber<T>>,
    // set once the topic has been removed from the registry
    retired: bool,
}

type Topic<T> = Mutex<TopicState<T>>;

/// Handle for one attached subscriber; pass it back to `unsubscribe`.
pub struct SubscriberHandle<K, T> {
    id: u64,
    key: K,
    topic: Arc<Topic<T>>,
    detached: CancellationToken,
}

impl<K: Clone, T> Clone for SubscriberHandle<K, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            key: self.key.clone(),
            topic: Arc::clone(&self.topic),
            detached: self.detached.clone(),
        }
    }
}

impl<K, T> SubscriberHandle<K, T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }
}

/// Inbound side of a subscription. Yields nothing once detachment begins.
pub struct SubscriptionStream<T> {
    id: u64,
    inbound: Inbound<T>,
    detached: CancellationToken,
}

impl<T: Send + Sync + 'static> SubscriptionStream<T> {
    /// Next delivery, or `None` once detached or the bus has let go of us.
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.detached.cancelled() => return None,
                next = recv_inbound(&mut self.inbound) => next,
            };
            match next {
                Ok(delivery) => return Some(delivery),
                Err(Some(skipped)) => {
                    warn!(subscription_id = self.id, skipped, "Subscriber lagged, oldest deliveries dropped");
                }
                Err(None) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Delivery<T>> + Send {
        futures::stream::unfold(self, |mut s| async move { s.recv().await.map(|d| (d, s)) })
    }
}

// Err(Some(n)) reports n skipped deliveries, Err(None) a closed channel.
async fn recv_inbound<T: Send + Sync>(
    inbound: &mut Inbound<T>,
) -> std::result::Result<Delivery<T>, Option<u64>> {
    match inbound {
        Inbound::Queued(rx) => rx.recv().await.ok_or(None),
        Inbound::Lossy(rx) => match rx.recv().await {
            Ok(d) => Ok(d),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(Some(n)),
            Err(broadcast::error::RecvError::Closed) => Err(None),
        },
    }
}

/// Event bus core implementation
pub struct EventBus<K, T> {
    // Topic key -> attached subscribers
    topics: DashMap<K, Arc<Topic<T>>>,

    // Statistics
    stats: DashMap<K, EventBusStats>,

    // Per-subscriber queue bound and what happens when it is full
    capacity: usize,
    backpressure: Backpressure,

    next_id: AtomicU64,
}

impl<K, T> EventBus<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new(capacity: usize, backpressure: Backpressure) -> Self {
        Self {
            topics: DashMap::new(),
            stats: DashMap::new(),
            capacity: capacity.clamp(1, MAX_SUBSCRIBER_CAPACITY),
            backpressure,
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish to every subscriber attached right now. Returns how many
    /// subscribers took the delivery; later subscribers never see it.
    #[tracing::instrument(skip(self, payload))]
    pub async fn publish(&self, key: &K, payload: T) -> u64 {
        self.publish_shared(key, Arc::new(payload)).await
    }

    pub async fn publish_shared(&self, key: &K, payload: Delivery<T>) -> u64 {
        let Some(topic) = self.topics.get(key).map(|t| Arc::clone(t.value())) else {
            debug!("No subscriptions for topic");
            return 0;
        };

        let state = topic.lock().await;
        if state.retired {
            debug!("Topic retired before publish");
            return 0;
        }
        self.update_stats(key, |stats| stats.total_published += 1);
        let mut delivered = 0;
        let mut dropped = 0;

        for sub in state.subscribers.iter() {
            if sub.detached.is_cancelled() {
                continue;
            }
            match &sub.outbound {
                Outbound::Lossy(tx) => {
                    // a full ring evicts its oldest entry to make room
                    if tx.len() >= self.lossy_capacity() {
                        dropped += 1;
                    }
                    if tx.send(Arc::clone(&payload)).is_ok() {
                        delivered += 1;
                    }
                }
                Outbound::Queued(tx) => {
                    tokio::select! {
                        res = tx.send(Arc::clone(&payload)) => match res {
                            Ok(()) => delivered += 1,
                            // receiver gone; detachment is racing us
                            Err(_) => debug!(subscription_id = sub.id, "Delivery to closed subscriber skipped"),
                        },
                        _ = sub.detached.cancelled() => {
                            debug!(subscription_id = sub.id, "Subscriber detached while publisher waited");
                        }
                    }
                }
            }
        }
        self.update_stats(key, |stats| {
            stats.total_delivered += delivered;
            stats.dropped_events += dropped;
        });
        drop(state);

        if dropped > 0 {
            warn!(dropped, "Subscriber queues full, oldest deliveries evicted");
        }
        delivered
    }

    /// Attach a new subscriber to `key`'s topic, creating the topic if needed.
    pub async fn subscribe(&self, key: K) -> (SubscriberHandle<K, T>, SubscriptionStream<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let detached = CancellationToken::new();
        let (outbound, inbound) = match self.backpressure {
            Backpressure::Block => {
                let (tx, rx) = mpsc::channel(self.capacity);
                (Outbound::Queued(tx), Inbound::Queued(rx))
            }
            Backpressure::DropOldest => {
                let (tx, rx) = broadcast::channel(self.lossy_capacity());
                (Outbound::Lossy(tx), Inbound::Lossy(rx))
            }
        };

        let (topic, mut state) = self.live_topic(&key).await;
        state.subscribers.push(Subscriber {
            id,
            outbound,
            detached: detached.clone(),
        });
        self.update_stats(&key, |stats| stats.active_subscriptions += 1);
        drop(state);

        info!(subscription_id = id, topic = ?key, "Created subscription");

        (
            SubscriberHandle {
                id,
                key,
                topic,
                detached: detached.clone(),
            },
            SubscriptionStream {
                id,
                inbound,
                detached,
            },
        )
    }

    /// Detach a subscriber. Safe to call more than once.
    pub async fn unsubscribe(&self, handle: &SubscriberHandle<K, T>) {
        // Cancel first: stops the stream and frees a publisher blocked on it.
        handle.detached.cancel();

        let mut state = handle.topic.lock().await;
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != handle.id);
        let removed = state.subscribers.len() != before;
        if removed {
            self.update_stats(&handle.key, |stats| {
                stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
            });
        }

        if state.subscribers.is_empty() && !state.retired {
            self.retire(&handle.key, &handle.topic, &mut state);
        }
        drop(state);

        if removed {
            info!(subscription_id = handle.id, topic = ?handle.key, "Unsubscribed");
        }
    }

    /// Detach every subscriber on every topic.
    pub async fn shutdown(&self) {
        info!("Event Bus shutting down");
        let topics: Vec<(K, Arc<Topic<T>>)> = self
            .topics
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (key, topic) in topics {
            let mut state = topic.lock().await;
            for sub in state.subscribers.drain(..) {
                sub.detached.cancel();
            }
            if !state.retired {
                self.retire(&key, &topic, &mut state);
            }
        }
    }

    // Caller holds the topic's lock. Stats go first so a topic recreated
    // under the same key never loses its fresh entry.
    fn retire(&self, key: &K, topic: &Arc<Topic<T>>, state: &mut TopicState<T>) {
        state.retired = true;
        self.stats.remove(key);
        self.topics.remove_if(key, |_, t| Arc::ptr_eq(t, topic));
        debug!(topic = ?key, "Topic retired");
    }

    /// Get stats
    pub fn get_stats(&self, key: &K) -> Option<EventBusStats> {
        self.stats.get(key).map(|s| s.clone())
    }

    /// Number of live topics
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of topics carrying stats; never more than the live topics.
    pub fn stats_count(&self) -> usize {
        self.stats.len()
    }

    pub async fn subscriber_count(&self, key: &K) -> usize {
        let Some(topic) = self.topics.get(key).map(|t| Arc::clone(t.value())) else {
            return 0;
        };
        let state = topic.lock().await;
        state.subscribers.len()
    }

    // Lock a topic that is still registered, replacing a retired one.
    async fn live_topic(&self, key: &K) -> (Arc<Topic<T>>, OwnedMutexGuard<TopicState<T>>) {
        loop {
            let topic = self
                .topics
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(TopicState {
                        subscribers: Vec::new(),
                        retired: false,
                    }))
                })
                .value()
                .clone();
            let state = Arc::clone(&topic).lock_owned().await;
            if !state.retired {
                return (topic, state);
            }
        }
    }

    fn lossy_capacity(&self) -> usize {
        // broadcast rings round up to a power of two; capacity is clamped in
        // `new`, so this cannot overflow
        self.capacity.next_power_of_two()
    }

    // Only called with the topic's lock held on a live topic.
    fn update_stats<F>(&self, key: &K, f: F)
    where
        F: FnOnce(&mut EventBusStats),
    {
        f(self.stats.entry(key.clone()).or_default().value_mut());
    }
}

impl<K, T> Default for EventBus<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(64, Backpressure::DropOldest)
    }
}
