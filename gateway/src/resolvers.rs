//! Query and mutation resolvers.
//!
//! Each takes the operation's [`RequestContext`]; reads go through its
//! loader scope, state changes go through the decision engine and are then
//! published on the agent's topic according to the mutation's policy.

use crate::context::RequestContext;
use crate::protocol::AccessRequest;
use crate::{OperationError, OperationResult};
use irl_core::{
    Agent, AuditEntry, Identity, QuotaAllocation, StateSnapshot, ThrottlingDecision,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub const SERVER_VERSION: &str = "irl-graphql-v1";

/// Entries returned by `auditTrail` when no limit is given
pub const DEFAULT_AUDIT_TRAIL_LIMIT: usize = 20;

pub fn server_version() -> &'static str {
    SERVER_VERSION
}

/// Agent with its optional nested fields resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotas: Option<QuotaAllocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_trail: Option<Vec<AuditEntry>>,
}

#[instrument(skip(ctx))]
pub async fn agent(ctx: &RequestContext, id: &str) -> OperationResult<Option<Agent>> {
    Ok(ctx.loaders.agent.load(id.to_string()).await?)
}

/// `agent(id)` plus the requested nested fields. Nested loads for one agent
/// run concurrently and share the context's loader scope.
pub async fn agent_view(
    ctx: &RequestContext,
    id: &str,
    with_quotas: bool,
    audit_limit: Option<usize>,
) -> OperationResult<Option<AgentView>> {
    let Some(agent) = agent(ctx, id).await? else {
        return Ok(None);
    };

    let quotas = async {
        if with_quotas {
            agent_quotas(ctx, &agent).await.map(Some)
        } else {
            Ok(None)
        }
    };
    let audit = async {
        match audit_limit {
            Some(limit) => audit_trail(ctx, &agent, Some(limit)).await.map(Some),
            None => Ok(None),
        }
    };
    let (quotas, audit_trail) = tokio::join!(quotas, audit);

    Ok(Some(AgentView {
        quotas: quotas?,
        audit_trail: audit_trail?,
        agent,
    }))
}

/// Quota for an agent; an agent with no stored allocation gets the zero shape.
#[instrument(skip(ctx))]
pub async fn quota(ctx: &RequestContext, agent_id: &str) -> OperationResult<QuotaAllocation> {
    Ok(ctx
        .loaders
        .quota
        .load(agent_id.to_string())
        .await?
        .unwrap_or_default())
}

/// `Agent.quotas`
pub async fn agent_quotas(ctx: &RequestContext, agent: &Agent) -> OperationResult<QuotaAllocation> {
    quota(ctx, &agent.id).await
}

/// `Agent.auditTrail(limit)`, oldest first, at most `limit` entries.
pub async fn audit_trail(
    ctx: &RequestContext,
    agent: &Agent,
    limit: Option<usize>,
) -> OperationResult<Vec<AuditEntry>> {
    let mut entries = ctx
        .loaders
        .audit
        .load(agent.id.clone())
        .await?
        .unwrap_or_default();
    entries.truncate(limit.unwrap_or(DEFAULT_AUDIT_TRAIL_LIMIT));
    Ok(entries)
}

#[instrument(skip(ctx, input), fields(agent_id = %input.agent_id, action = %input.action))]
pub async fn request_access(
    ctx: &RequestContext,
    input: &AccessRequest,
) -> OperationResult<ThrottlingDecision> {
    require_agent_id(&input.agent_id)?;
    let decision = ctx
        .engine
        .decide(&input.agent_id, &input.action)
        .await
        .map_err(|e| {
            warn!(error = %e, "Decision engine failed");
            OperationError::from(e)
        })?;

    if ctx.policies.request_access.should_publish(decision.allowed) {
        let quota = match decision.snapshot.clone() {
            Some(q) => q,
            None => quota(ctx, &input.agent_id).await?,
        };
        publish(ctx, &input.agent_id, quota).await;
    }
    Ok(decision)
}

#[instrument(skip(ctx))]
pub async fn request_override(
    ctx: &RequestContext,
    agent_id: &str,
    amount: i64,
) -> OperationResult<QuotaAllocation> {
    let identity = require_admin(ctx.identity.as_ref())?;
    require_agent_id(agent_id)?;

    let quota = ctx
        .engine
        .override_quota(agent_id, amount)
        .await
        .map_err(|e| {
            warn!(error = %e, "Quota override failed");
            OperationError::from(e)
        })?;
    info!(subject = %identity.subject, agent_id, amount, "Quota overridden");

    if ctx.policies.request_override.should_publish(true) {
        publish(ctx, agent_id, quota.clone()).await;
    }
    Ok(quota)
}

/// Subscriptions need a verified caller.
pub fn require_identity(identity: Option<&Identity>) -> OperationResult<&Identity> {
    identity.ok_or(OperationError::Unauthenticated)
}

fn require_admin(identity: Option<&Identity>) -> OperationResult<&Identity> {
    match identity {
        Some(id) if id.is_admin() => Ok(id),
        _ => Err(OperationError::Unauthorized),
    }
}

fn require_agent_id(agent_id: &str) -> OperationResult<()> {
    if agent_id.trim().is_empty() {
        return Err(OperationError::BadRequest("agentId must not be empty".into()));
    }
    Ok(())
}

async fn publish(ctx: &RequestContext, agent_id: &str, quota: QuotaAllocation) {
    let snapshot = StateSnapshot::new(agent_id, quota);
    let delivered = ctx.event_bus.publish(&agent_id.to_string(), snapshot).await;
    debug!(agent_id, delivered, "Quota snapshot published");
}
