//! Error taxonomy
//!
//! Domain errors (expected business conditions) and infrastructure errors
//! (external/system failures) are kept distinct so callers can decide on
//! retries. `ConfirmationRequired` is a gate sentinel: it aborts a
//! fulfillment invocation and must never be retried without re-opening the
//! confirmation gate.

use crate::store::StoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Raised only by the fulfillment agent when the confirmation flag is
    /// false. Non-recoverable for the invocation.
    #[error("confirmation required for session {session_id}")]
    ConfirmationRequired { session_id: String },

    #[error("validation failure: {0}")]
    Validation(String),

    #[error("safety policy violation: {0}")]
    PolicyViolation(String),

    #[error(transparent)]
    Inventory(#[from] StoreError),

    #[error("fulfillment problem: {0}")]
    Fulfillment(String),

    #[error("{message}")]
    Infrastructure {
        message: String,
        recoverable: bool,
        /// Seconds to wait before a retry, when recoverable.
        retry_after: Option<u64>,
    },
}

impl AgentError {
    pub fn error_type(&self) -> &'static str {
        match self {
            AgentError::ConfirmationRequired { .. } => "ConfirmationRequired",
            AgentError::Validation(_) => "ValidationFailure",
            AgentError::PolicyViolation(_) => "PolicyViolation",
            AgentError::Inventory(e) => e.error_type(),
            AgentError::Fulfillment(_) => "FulfillmentProblem",
            AgentError::Infrastructure { .. } => "InfrastructureError",
        }
    }

    pub fn recoverable(&self) -> bool {
        match self {
            AgentError::ConfirmationRequired { .. } => false,
            AgentError::Validation(_) | AgentError::PolicyViolation(_) => false,
            AgentError::Inventory(e) => e.recoverable(),
            AgentError::Fulfillment(_) => true,
            AgentError::Infrastructure { recoverable, .. } => *recoverable,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AgentError::Inventory(e) => e.retry_after(),
            AgentError::Infrastructure { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            error_type: self.error_type().to_string(),
            message: self.to_string(),
            recoverable: self.recoverable(),
            retry_after: self.retry_after(),
        }
    }
}

/// Serializable view of an error, recorded in agent trace metadata and event
/// payloads.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error_type: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}
