// IRL Core Library
// Batched agent-state access, credential verification and quota event fan-out

pub mod agent_loaders;
pub mod auth;
pub mod config;
pub mod decision;
pub mod event;
pub mod loader;
pub mod store;
pub mod telemetry;
pub mod types;

// Export core types
pub use agent_loaders::AgentStateLoaders;
pub use auth::{AuthContext, Claims, Identity};
pub use config::{Backpressure, IrlConfig, PublishPolicy};
pub use decision::{DecisionEngine, StubDecisionEngine};
pub use event::{Delivery, EventBus, EventBusStats, SubscriberHandle, SubscriptionStream};
pub use loader::{BatchFn, KeyedBatchLoader, LoadError};
pub use store::{InMemoryKvStore, KvStore};
pub use types::{
    Agent, AuditEntry, QuotaAllocation, StateSnapshot, ThrottlingDecision, TierLevel,
};

/// Bus carrying quota snapshots, one topic per agent id.
pub type QuotaEventBus = EventBus<String, StateSnapshot>;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IrlError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Decision engine error: {0}")]
    Decision(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, IrlError>;
