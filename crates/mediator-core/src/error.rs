use crate::{CallId, CallStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Invalid transition for call {id}: {from} -> {to}")]
    InvalidTransition {
        id: CallId,
        from: CallStatus,
        to: CallStatus,
    },

    #[error("Call {id} cannot be resubmitted while {status}")]
    NotResubmittable { id: CallId, status: CallStatus },

    #[error("Call {0} has been garbage collected; its arguments are gone")]
    Purged(CallId),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid method name: {0:?}")]
    InvalidMethodName(String),
}

pub type Result<T> = std::result::Result<T, CallError>;
