//! Connection wire messages, JSON tagged by `type`.
//!
//! Client: `connection_init`, `subscribe`, `complete`, `ping`.
//! Server: `connection_ack`, `next`, `error`, `complete`, `pong`.

use crate::ErrorPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<ConnectionInitPayload>,
    },
    Subscribe {
        id: String,
        payload: Operation,
    },
    Complete {
        id: String,
    },
    Ping,
}

/// Connection parameters sent with `connection_init`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInitPayload {
    #[serde(default, alias = "Authorization")]
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub agent_id: String,
    pub action: String,
}

/// An operation a client can start on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "variables", rename_all = "camelCase")]
pub enum Operation {
    ServerVersion,
    #[serde(rename_all = "camelCase")]
    Agent {
        id: String,
        #[serde(default)]
        quotas: bool,
        /// Include `auditTrail` with this many entries
        #[serde(default)]
        audit_trail: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Quota { agent_id: String },
    RequestAccess { input: AccessRequest },
    #[serde(rename_all = "camelCase")]
    RequestOverride { agent_id: String, amount: i64 },
    #[serde(rename_all = "camelCase")]
    QuotaUpdates { agent_id: String },
}

impl Operation {
    /// Root field the result is reported under
    pub fn field(&self) -> &'static str {
        match self {
            Operation::ServerVersion => "serverVersion",
            Operation::Agent { .. } => "agent",
            Operation::Quota { .. } => "quota",
            Operation::RequestAccess { .. } => "requestAccess",
            Operation::RequestOverride { .. } => "requestOverride",
            Operation::QuotaUpdates { .. } => "quotaUpdates",
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self, Operation::QuotaUpdates { .. })
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::RequestAccess { .. } | Operation::RequestOverride { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    Next {
        id: String,
        payload: Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: Vec<ErrorPayload>,
    },
    Complete {
        id: String,
    },
    Pong,
}

impl ServerMessage {
    /// `next` carrying `{"data": {field: data}}`
    pub fn next(id: &str, field: &str, data: Value) -> Self {
        let mut fields = serde_json::Map::new();
        fields.insert(field.to_string(), data);
        let mut payload = serde_json::Map::new();
        payload.insert("data".to_string(), Value::Object(fields));
        ServerMessage::Next {
            id: id.to_string(),
            payload: Value::Object(payload),
        }
    }

    pub fn error(id: Option<&str>, error: &crate::OperationError) -> Self {
        ServerMessage::Error {
            id: id.map(str::to_string),
            payload: vec![error.to_payload()],
        }
    }
}
