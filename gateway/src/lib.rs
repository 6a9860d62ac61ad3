// IRL Gateway
// Query/mutation resolvers and the quota subscription connection layer

pub mod context;
pub mod gateway;
pub mod protocol;
pub mod resolvers;

pub use context::{GatewayServices, PublishPolicies, RequestContext};
pub use gateway::{serve_connection, Connection, ConnectionState, SubscriptionGateway};
pub use protocol::{AccessRequest, ClientMessage, ConnectionInitPayload, Operation, ServerMessage};

use irl_core::{IrlError, LoadError};
use serde::{Deserialize, Serialize};

/// Failure of a single operation. Reported on that operation's own result
/// channel; never closes the connection it arrived on.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("Not authorized")]
    Unauthorized,
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Decision engine error: {0}")]
    Decision(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Connection not initialised")]
    NotInitialised,
    #[error("Operation {0} already in progress")]
    DuplicateOperation(String),
}

impl OperationError {
    pub fn code(&self) -> &'static str {
        match self {
            OperationError::Unauthenticated => "UNAUTHENTICATED",
            OperationError::Unauthorized => "UNAUTHORIZED",
            OperationError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            OperationError::Decision(_) => "DECISION_FAILED",
            OperationError::BadRequest(_) => "BAD_REQUEST",
            OperationError::NotInitialised => "NOT_INITIALISED",
            OperationError::DuplicateOperation(_) => "DUPLICATE_OPERATION",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            code: self.code().to_string(),
        }
    }
}

impl From<LoadError> for OperationError {
    fn from(e: LoadError) -> Self {
        OperationError::StoreUnavailable(e.message().to_string())
    }
}

impl From<IrlError> for OperationError {
    fn from(e: IrlError) -> Self {
        match e {
            IrlError::InvalidCredential(_) => OperationError::Unauthenticated,
            IrlError::Decision(msg) => OperationError::Decision(msg),
            IrlError::StoreUnavailable(msg) => OperationError::StoreUnavailable(msg),
            IrlError::Serialization(e) => OperationError::BadRequest(e.to_string()),
            other => OperationError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Wire shape of an operation error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

pub type OperationResult<T> = std::result::Result<T, OperationError>;
