//! Runtime configuration, read from the environment (and `.env` if present).

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::agent_loaders::DEFAULT_AUDIT_FETCH_LIMIT;

const DEFAULT_JWT_SECRET: &str = "your-secret-key-change-in-production";

/// Largest per-subscriber queue the event bus will allocate.
pub const MAX_SUBSCRIBER_CAPACITY: usize = 1 << 16;

/// What a publish does when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Evict the subscriber's oldest undelivered item; publishers never wait.
    #[default]
    DropOldest,
    /// Publisher waits for room (or for the subscriber to detach).
    Block,
}

impl FromStr for Backpressure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Ok(Backpressure::DropOldest),
            "block" => Ok(Backpressure::Block),
            other => Err(format!("unknown backpressure policy: {other}")),
        }
    }
}

/// When a mutation publishes the resulting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    Always,
    OnDeny,
    OnAllow,
    Never,
}

impl PublishPolicy {
    pub fn should_publish(self, allowed: bool) -> bool {
        match self {
            PublishPolicy::Always => true,
            PublishPolicy::OnDeny => !allowed,
            PublishPolicy::OnAllow => allowed,
            PublishPolicy::Never => false,
        }
    }
}

impl FromStr for PublishPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(PublishPolicy::Always),
            "on_deny" => Ok(PublishPolicy::OnDeny),
            "on_allow" => Ok(PublishPolicy::OnAllow),
            "never" => Ok(PublishPolicy::Never),
            other => Err(format!("unknown publish policy: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IrlConfig {
    pub jwt_secret: String,
    pub store_timeout: Duration,
    pub audit_fetch_limit: usize,
    pub subscriber_capacity: usize,
    pub backpressure: Backpressure,
    pub outbound_capacity: usize,
    pub publish_on_access: PublishPolicy,
    pub publish_on_override: PublishPolicy,
    pub seed_file: Option<String>,
}

impl Default for IrlConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            store_timeout: Duration::from_millis(2_000),
            audit_fetch_limit: DEFAULT_AUDIT_FETCH_LIMIT,
            subscriber_capacity: 64,
            backpressure: Backpressure::DropOldest,
            outbound_capacity: 512,
            publish_on_access: PublishPolicy::OnDeny,
            publish_on_override: PublishPolicy::Always,
            seed_file: None,
        }
    }
}

impl IrlConfig {
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source, falling back per field.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let jwt_secret = var("JWT_SECRET").unwrap_or_else(|| {
            tracing::warn!("JWT_SECRET not set; using the built-in development secret");
            d.jwt_secret.clone()
        });

        Self {
            jwt_secret,
            store_timeout: parsed(&var, "IRL_STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.store_timeout),
            audit_fetch_limit: parsed(&var, "IRL_AUDIT_FETCH_LIMIT").unwrap_or(d.audit_fetch_limit),
            subscriber_capacity: bounded(
                "IRL_SUBSCRIBER_CAPACITY",
                parsed(&var, "IRL_SUBSCRIBER_CAPACITY").unwrap_or(d.subscriber_capacity),
                MAX_SUBSCRIBER_CAPACITY,
            ),
            backpressure: parsed(&var, "IRL_BACKPRESSURE").unwrap_or(d.backpressure),
            outbound_capacity: bounded(
                "IRL_OUTBOUND_CAPACITY",
                parsed(&var, "IRL_OUTBOUND_CAPACITY").unwrap_or(d.outbound_capacity),
                usize::MAX >> 4,
            ),
            publish_on_access: parsed(&var, "IRL_PUBLISH_ON_ACCESS").unwrap_or(d.publish_on_access),
            publish_on_override: parsed(&var, "IRL_PUBLISH_ON_OVERRIDE")
                .unwrap_or(d.publish_on_override),
            seed_file: var("IRL_SEED_FILE"),
        }
    }
}

fn parsed<T, F>(var: &F, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "Ignoring unparseable setting");
            None
        }
    }
}

// Queue sizes must be at least one and no larger than `max`.
fn bounded(name: &str, value: usize, max: usize) -> usize {
    let clamped = value.clamp(1, max);
    if clamped != value {
        tracing::warn!(var = name, value, used = clamped, "Queue size out of range, clamped");
    }
    clamped
}
