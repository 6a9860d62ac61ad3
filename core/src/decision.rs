//! Contract of the external quota decision engine, plus the stub the service
//! runs with until a real engine is wired in.

use crate::types::{QuotaAllocation, ThrottlingDecision};
use crate::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tracing::debug;

/// Quota decisions are opaque to this layer; callers may retry, we do not.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    /// Decide whether `agent_id` may perform `action` now.
    async fn decide(&self, agent_id: &str, action: &str) -> Result<ThrottlingDecision>;

    /// Replace the agent's allocation, returning the new state.
    async fn override_quota(&self, agent_id: &str, amount: i64) -> Result<QuotaAllocation>;
}

/// Allows everything and derives overrides from the amount alone.
#[derive(Debug, Default, Clone)]
pub struct StubDecisionEngine;

#[async_trait]
impl DecisionEngine for StubDecisionEngine {
    async fn decide(&self, agent_id: &str, action: &str) -> Result<ThrottlingDecision> {
        debug!(agent_id, action, "stub decision");
        Ok(ThrottlingDecision {
            allowed: true,
            reason: Some("stub".to_string()),
            estimated_wait_time: None,
            next_available_slot: None,
            snapshot: None,
        })
    }

    async fn override_quota(&self, agent_id: &str, amount: i64) -> Result<QuotaAllocation> {
        debug!(agent_id, amount, "stub override");
        Ok(QuotaAllocation {
            requests_per_minute: amount,
            requests_per_hour: amount.saturating_mul(60),
            daily_energy_limit: 0.0,
            escalations_available: None,
            reset_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}
