//! Dependencies handed to every operation.
//!
//! [`GatewayServices`] lives as long as the process and is shared by every
//! connection. A [`RequestContext`] is built per operation and owns a fresh
//! loader scope, so nothing cached by one operation is seen by another.

use irl_core::{
    AgentStateLoaders, AuthContext, DecisionEngine, EventBus, Identity, IrlConfig, KvStore,
    PublishPolicy, QuotaEventBus,
};
use std::sync::Arc;
use std::time::Duration;

/// Publish behaviour per mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicies {
    pub request_access: PublishPolicy,
    pub request_override: PublishPolicy,
}

impl Default for PublishPolicies {
    fn default() -> Self {
        Self {
            request_access: PublishPolicy::OnDeny,
            request_override: PublishPolicy::Always,
        }
    }
}

#[derive(Clone)]
pub struct GatewayServices {
    pub store: Arc<dyn KvStore>,
    pub auth: Arc<AuthContext>,
    pub event_bus: Arc<QuotaEventBus>,
    pub engine: Arc<dyn DecisionEngine>,
    pub policies: PublishPolicies,
    pub store_timeout: Option<Duration>,
    pub audit_fetch_limit: usize,
    // per-connection outbound queue bound
    pub outbound_capacity: usize,
}

impl GatewayServices {
    pub fn new(store: Arc<dyn KvStore>, engine: Arc<dyn DecisionEngine>, config: &IrlConfig) -> Self {
        Self {
            store,
            auth: Arc::new(AuthContext::new(&config.jwt_secret)),
            event_bus: Arc::new(EventBus::new(config.subscriber_capacity, config.backpressure)),
            engine,
            policies: PublishPolicies {
                request_access: config.publish_on_access,
                request_override: config.publish_on_override,
            },
            store_timeout: Some(config.store_timeout),
            audit_fetch_limit: config.audit_fetch_limit,
            outbound_capacity: config.outbound_capacity.max(1),
        }
    }

    /// A new, empty loader scope.
    pub fn loaders(&self) -> AgentStateLoaders {
        AgentStateLoaders::with_options(
            Arc::clone(&self.store),
            self.store_timeout,
            self.audit_fetch_limit,
        )
    }

    /// Context for a query or mutation carrying its own `Authorization` header.
    pub fn request_context(&self, authorization: Option<&str>) -> RequestContext {
        let identity = self.auth.resolve_optional(authorization);
        self.context_for(identity)
    }

    /// Context for an operation whose identity is already resolved, e.g. the
    /// one a connection established at init.
    pub fn context_for(&self, identity: Option<Identity>) -> RequestContext {
        RequestContext {
            identity,
            loaders: self.loaders(),
            event_bus: Arc::clone(&self.event_bus),
            engine: Arc::clone(&self.engine),
            policies: self.policies,
        }
    }
}

/// Everything one operation may touch
pub struct RequestContext {
    pub identity: Option<Identity>,
    pub loaders: AgentStateLoaders,
    pub event_bus: Arc<QuotaEventBus>,
    pub engine: Arc<dyn DecisionEngine>,
    pub policies: PublishPolicies,
}
