//! Core contracts for durable flows: identifiers, resumable activations,
//! their persisted records, type resolution, reference marshaling and
//! cancellation.
//!
//! Nothing in this crate performs I/O. Storage lives in `dflow-persistence`
//! and the engine that drives activations lives in `dflow-runtime`.

pub mod cancellation;
pub mod codec;
pub mod context;
pub mod continuation;
pub mod error;
pub mod id;
pub mod marshal;
pub mod record;
pub mod registry;
pub mod serialization;
pub mod types;

pub use error::{Fault, FlowError, Outcome};
pub use id::FlowId;
pub use serde_json::Value;
