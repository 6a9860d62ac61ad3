//! Agent state shapes shared by loaders, resolvers and the event bus.
//!
//! Everything here serialises camelCase so payloads match the field names
//! clients query for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Service tier of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierLevel {
    #[default]
    Research,
    Education,
    Nonprofit,
    Startup,
    Enterprise,
}

impl FromStr for TierLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RESEARCH" => Ok(TierLevel::Research),
            "EDUCATION" => Ok(TierLevel::Education),
            "NONPROFIT" => Ok(TierLevel::Nonprofit),
            "STARTUP" => Ok(TierLevel::Startup),
            "ENTERPRISE" => Ok(TierLevel::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TierLevel::Research => "RESEARCH",
            TierLevel::Education => "EDUCATION",
            TierLevel::Nonprofit => "NONPROFIT",
            TierLevel::Startup => "STARTUP",
            TierLevel::Enterprise => "ENTERPRISE",
        };
        f.write_str(s)
    }
}

/// Agent profile as stored under `agent:{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub tier: TierLevel,
}

/// Quota allocation as stored under `quota:{id}`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaAllocation {
    pub requests_per_minute: i64,
    pub requests_per_hour: i64,
    pub daily_energy_limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalations_available: Option<i64>,
    pub reset_time: String,
}

/// One audit record from `audit:{id}`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditEntry {
    pub timestamp: String,
    pub endpoint: String,
    pub result: String,
    pub tokens: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of an access request from the decision engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlingDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Milliseconds until a retry is expected to succeed
    pub estimated_wait_time: Option<i64>,
    pub next_available_slot: Option<String>,
    /// Quota state the decision was made against
    #[serde(skip)]
    pub snapshot: Option<QuotaAllocation>,
}

/// Immutable view of an agent's quota state, published on the agent's topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub agent_id: String,
    pub quota: QuotaAllocation,
    pub published_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(agent_id: impl Into<String>, quota: QuotaAllocation) -> Self {
        Self {
            agent_id: agent_id.into(),
            quota,
            published_at: Utc::now(),
        }
    }
}
