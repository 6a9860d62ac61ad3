//! Agent profile, quota and audit loaders over the backing store.
//!
//! Stored records are read defensively: missing or garbled fields default and
//! are logged, they never fail a load.

use crate::loader::{BatchFn, KeyedBatchLoader};
use crate::store::KvStore;
use crate::types::{Agent, AuditEntry, QuotaAllocation, TierLevel};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Audit entries fetched per agent (`0..=100`)
pub const DEFAULT_AUDIT_FETCH_LIMIT: usize = 101;

pub fn agent_key(id: &str) -> String {
    format!("agent:{id}")
}

pub fn quota_key(id: &str) -> String {
    format!("quota:{id}")
}

pub fn audit_key(id: &str) -> String {
    format!("audit:{id}")
}

struct ProfileBatch {
    store: Arc<dyn KvStore>,
}

#[async_trait]
impl BatchFn<String, Agent> for ProfileBatch {
    async fn load(&self, ids: &[String]) -> Result<HashMap<String, Agent>> {
        let keys: Vec<String> = ids.iter().map(|id| agent_key(id)).collect();
        let records = self.store.hash_get_all_many(&keys).await?;
        Ok(ids
            .iter()
            .zip(records)
            .filter(|(_, fields)| !fields.is_empty())
            .map(|(id, fields)| (id.clone(), parse_agent(id, &fields)))
            .collect())
    }
}

struct QuotaBatch {
    store: Arc<dyn KvStore>,
}

#[async_trait]
impl BatchFn<String, QuotaAllocation> for QuotaBatch {
    async fn load(&self, ids: &[String]) -> Result<HashMap<String, QuotaAllocation>> {
        let keys: Vec<String> = ids.iter().map(|id| quota_key(id)).collect();
        let records = self.store.hash_get_all_many(&keys).await?;
        // every id gets an allocation, an absent record yields the zero shape
        Ok(ids
            .iter()
            .zip(records)
            .map(|(id, fields)| (id.clone(), parse_quota(id, &fields)))
            .collect())
    }
}

struct AuditBatch {
    store: Arc<dyn KvStore>,
    fetch_limit: usize,
}

#[async_trait]
impl BatchFn<String, Vec<AuditEntry>> for AuditBatch {
    async fn load(&self, ids: &[String]) -> Result<HashMap<String, Vec<AuditEntry>>> {
        let end = self.fetch_limit as i64 - 1;
        let lists = futures::future::try_join_all(
            ids.iter()
                .map(|id| async move { self.store.list_range(&audit_key(id), 0, end).await }),
        )
        .await?;
        Ok(ids
            .iter()
            .zip(lists)
            .map(|(id, raw)| (id.clone(), parse_audit(id, &raw)))
            .collect())
    }
}

fn parse_agent(id: &str, fields: &HashMap<String, String>) -> Agent {
    let tier = match fields.get("tier") {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!(agent_id = %id, error = %e, "Unrecognised tier in stored profile");
            TierLevel::default()
        }),
        None => TierLevel::default(),
    };
    Agent {
        id: id.to_string(),
        name: fields.get("name").cloned().unwrap_or_default(),
        tier,
    }
}

fn parse_int(id: &str, fields: &HashMap<String, String>, field: &str) -> i64 {
    let Some(raw) = fields.get(field) else {
        return 0;
    };
    // integer prefix, the way the record writers format it
    let trimmed = raw.trim();
    let digits: String = trimmed
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(_, c)| c)
        .collect();
    digits.parse().unwrap_or_else(|_| {
        warn!(agent_id = %id, field, value = %raw, "Malformed integer in stored quota");
        0
    })
}

fn parse_float(id: &str, fields: &HashMap<String, String>, field: &str) -> f64 {
    match fields.get(field) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(agent_id = %id, field, value = %raw, "Malformed float in stored quota");
            0.0
        }),
        None => 0.0,
    }
}

fn parse_quota(id: &str, fields: &HashMap<String, String>) -> QuotaAllocation {
    QuotaAllocation {
        requests_per_minute: parse_int(id, fields, "requestsPerMinute"),
        requests_per_hour: parse_int(id, fields, "requestsPerHour"),
        daily_energy_limit: parse_float(id, fields, "dailyEnergyLimit"),
        escalations_available: fields
            .contains_key("escalationsAvailable")
            .then(|| parse_int(id, fields, "escalationsAvailable")),
        reset_time: fields.get("resetTime").cloned().unwrap_or_default(),
    }
}

fn parse_audit(id: &str, raw: &[String]) -> Vec<AuditEntry> {
    raw.iter()
        .filter_map(|line| match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(agent_id = %id, error = %e, "Skipping malformed audit entry");
                None
            }
        })
        .collect()
}

/// The three loaders for one operation scope. Build a fresh set per
/// execution; nothing cached here outlives it.
#[derive(Clone)]
pub struct AgentStateLoaders {
    pub agent: KeyedBatchLoader<String, Agent>,
    pub quota: KeyedBatchLoader<String, QuotaAllocation>,
    pub audit: KeyedBatchLoader<String, Vec<AuditEntry>>,
}

impl AgentStateLoaders {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_options(store, None, DEFAULT_AUDIT_FETCH_LIMIT)
    }

    pub fn with_options(
        store: Arc<dyn KvStore>,
        fetch_timeout: Option<Duration>,
        audit_fetch_limit: usize,
    ) -> Self {
        fn build<V>(name: &'static str, f: Arc<dyn BatchFn<String, V>>, t: Option<Duration>) -> KeyedBatchLoader<String, V>
        where
            V: Clone + Send + Sync + 'static,
        {
            match t {
                Some(limit) => KeyedBatchLoader::with_timeout(name, f, limit),
                None => KeyedBatchLoader::new(name, f),
            }
        }

        Self {
            agent: build(
                "agent",
                Arc::new(ProfileBatch {
                    store: Arc::clone(&store),
                }),
                fetch_timeout,
            ),
            quota: build(
                "quota",
                Arc::new(QuotaBatch {
                    store: Arc::clone(&store),
                }),
                fetch_timeout,
            ),
            audit: build(
                "audit",
                Arc::new(AuditBatch {
                    store,
                    fetch_limit: audit_fetch_limit.max(1),
                }),
                fetch_timeout,
            ),
        }
    }
}
