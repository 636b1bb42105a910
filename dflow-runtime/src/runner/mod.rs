use dflow_core::Outcome;
use dflow_core::continuation::Resumable;
use futures::future::BoxFuture;

/// A trait for executing flows to completion.
///
/// Different implementations can provide different execution strategies,
/// such as running everything in memory, or suspending to storage and
/// resuming later through a [`FlowDriver`](crate::FlowDriver).
pub trait FlowRunner: Send + Sync {
    /// Run `op` and everything it awaits, returning its outcome.
    ///
    /// Errors are failures of the runner itself; faults raised by the flow
    /// come back as `Ok(Err(fault))`.
    fn run<'r>(&'r self, op: Box<dyn Resumable>) -> BoxFuture<'r, anyhow::Result<Outcome>>;
}

pub mod in_process;
