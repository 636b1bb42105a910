//! Engine for durable flows.
//!
//! A [`FlowDriver`] runs a flow's activations, dehydrates them to storage
//! when the flow suspends and hydrates them again, one frame at a time,
//! when the host resumes it. [`InProcessRunner`] runs the same flows
//! without persisting anything.

pub mod activation;
pub mod aggregate;
pub mod delivery;
pub mod driver;
pub mod host;
pub mod state;

mod runner;

#[cfg(test)]
mod testing;

// Re-exports
pub use activation::{Activation, ResumeInput, Runnable};
pub use aggregate::{AggregateKind, AggregateRecord};
pub use delivery::{
    AggregateContinuation, ContinuationFactory, ContinuationMemento, FlowContinuation,
};
pub use driver::{DriverPool, FlowDriver, FlowState, FlowStatus};
pub use host::{DurableCodec, DurableHost, DurableHostBuilder, FlowHost, ManualScheduler, Scheduler};
pub use runner::FlowRunner;
pub use runner::in_process::InProcessRunner;
pub use state::{DefaultStateManager, StateCodec, StateManager};

pub use dflow_core as core;
pub use dflow_persistence as persistence;
