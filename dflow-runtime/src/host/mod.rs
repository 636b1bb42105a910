//! The environment a driver runs in.
//!
//! The driver owns the suspend/resume protocol; the host owns everything
//! around it: where state goes, which types exist, how wake-ups are
//! scheduled and who hears about terminal outcomes.

mod durable;
mod scheduler;

pub use durable::{DurableCodec, DurableHost, DurableHostBuilder};
pub use scheduler::{ManualScheduler, Scheduler, Wakeup, WakeupReason};

use crate::state::StateManager;
use async_trait::async_trait;
use dflow_core::cancellation::CancellationProvider;
use dflow_core::continuation::SuspensionCallback;
use dflow_core::marshal::Marshaler;
use dflow_core::types::TypeResolver;
use dflow_core::{Fault, FlowId, Value};
use std::sync::Arc;
use std::time::Duration;

/// Callbacks and collaborators a [`FlowDriver`](crate::FlowDriver) needs.
#[async_trait]
pub trait FlowHost: Send + Sync {
    fn type_resolver(&self) -> Arc<TypeResolver>;

    fn cancellation_provider(&self) -> Arc<dyn CancellationProvider>;

    /// A marshaler scoped to one driver run.
    fn create_marshaler(&self) -> Arc<dyn Marshaler>;

    fn create_state_manager(&self, marshaler: Arc<dyn Marshaler>) -> Box<dyn StateManager>;

    /// The flow `id` completed. A flow that returns nothing reports `null`.
    async fn on_succeed(&self, id: FlowId, result: Value) -> anyhow::Result<()>;

    async fn on_fail(&self, id: FlowId, fault: Fault) -> anyhow::Result<()>;

    async fn on_cancel(&self, id: FlowId, fault: Fault) -> anyhow::Result<()>;

    /// The flow `id` yielded; resume it soon.
    async fn on_yield(&self, id: FlowId) -> anyhow::Result<()>;

    /// The flow `id` is delayed; resume it after `delay`.
    async fn on_delay(&self, id: FlowId, delay: Duration) -> anyhow::Result<()>;

    /// The flow `id` is waiting for an external resume.
    async fn on_suspended(
        &self,
        id: FlowId,
        callback: Arc<dyn SuspensionCallback>,
    ) -> anyhow::Result<()> {
        callback.on_suspended(id).await
    }
}
