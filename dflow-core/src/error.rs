//! Error types for dflow-core.

use crate::id::FlowId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine-level failure.
///
/// These never travel through a flow: they describe why the engine itself
/// could not make progress (bad input, missing registrations, storage I/O).
/// User-visible failures inside a flow are [`Fault`]s.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// A flow id or other external token was malformed.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    /// A type or type id has no registration.
    #[error("Unknown type: '{0}'")]
    UnknownType(String),
    /// A type or type id was registered twice with different counterparts.
    #[error("Duplicate type registration: '{0}'")]
    DuplicateType(String),
    /// Persisted data for a flow is missing or inconsistent.
    #[error("Data relative to flow '{0}' was missing or corrupted")]
    CorruptedFlow(FlowId),
    /// A captured reference has no surrogate in scope.
    #[error("Slot '{0}' holds a reference that cannot be marshaled")]
    NotMarshalable(String),
    /// A reconstructor asked for a slot that was never captured.
    #[error("Slot '{0}' was not captured")]
    MissingSlot(String),
    /// Encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[source] anyhow::Error),
    /// The storage layer failed.
    #[error("Storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A host callback failed.
    #[error("Host callback failed: {0}")]
    Host(#[source] anyhow::Error),
    /// The engine was driven in a way its state machine does not allow.
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Codec(e.into())
    }
}

/// A failure raised by a flow's own logic.
///
/// Faults are data: they are persisted inside aggregate records and
/// delivered to parents and continuations, so they must serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    /// An operation failed.
    #[error("{message}")]
    Failed { message: String },
    /// An operation observed cancellation.
    #[error("Operation was cancelled: {message}")]
    Cancelled { message: String },
    /// Several operations of a `WhenAll` failed.
    #[error("{} operations failed", .faults.len())]
    Aggregate { faults: Vec<Fault> },
}

impl Fault {
    pub fn failed(message: impl Into<String>) -> Self {
        Fault::Failed {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Fault::Cancelled {
            message: message.into(),
        }
    }

    /// Whether this fault should be reported as a cancellation rather than
    /// a failure. Aggregates qualify only when every member does.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Fault::Failed { .. } => false,
            Fault::Cancelled { .. } => true,
            Fault::Aggregate { faults } => {
                !faults.is_empty() && faults.iter().all(Fault::is_cancellation)
            }
        }
    }
}

impl From<anyhow::Error> for Fault {
    fn from(e: anyhow::Error) -> Self {
        Fault::failed(format!("{:#}", e))
    }
}

impl From<FlowError> for Fault {
    fn from(e: FlowError) -> Self {
        Fault::failed(e.to_string())
    }
}

/// The result an activation produces or receives.
pub type Outcome = Result<Value, Fault>;
