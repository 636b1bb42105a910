//! The suspend/resume state machine.
//!
//! A [`FlowDriver`] runs a chain of activations until it either completes or
//! has to leave memory. On suspension every live activation is dehydrated
//! bottom to top, the batch is flushed, and only then is the host told how
//! to wake the flow. On resume the driver hydrates one frame at a time, so
//! frames that are never reached again are never rebuilt.
//!
//! `WhenAll`/`WhenAny` children run as chains of their own. A child that
//! completes in memory reports straight to its aggregate; a child that
//! suspends is persisted with a link to the aggregate and reports to the
//! persisted [`AggregateRecord`] when it eventually completes.

mod pool;

pub use pool::DriverPool;

use crate::activation::{Activation, ResumeInput};
use crate::aggregate::{AggregateKind, AggregateRecord};
use crate::host::FlowHost;
use crate::state::StateManager;
use dflow_core::cancellation::{
    CancellationHandler, CancellationId, CancellationProvider, CancellationSource,
};
use dflow_core::context::StepContext;
use dflow_core::continuation::{Await, Resumable, Step, Suspension};
use dflow_core::record::AwaitRecord;
use dflow_core::{Fault, FlowError, FlowId, Outcome, Value};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Lifecycle states of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    /// Pooled, not assigned to a flow.
    #[default]
    Idling,
    /// Assigned a flow id, not started.
    Pending,
    /// Executing activation code.
    Running,
    /// Capturing activations into frames.
    Dehydrating,
    /// Rebuilding an activation from a frame.
    Hydrating,
    /// Telling the host how to wake suspended chains.
    Suspending,
    /// Reporting a terminal outcome to the host.
    Returning,
    /// Running or collecting `WhenAll`/`WhenAny` children.
    Aggregating,
    /// Waiting on a bridged future or on storage.
    Awaiting,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How one `start`/`resume` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// The flow completed and `on_succeed` was called.
    Succeeded,
    /// The flow failed and `on_fail` was called.
    Failed,
    /// The flow observed cancellation and `on_cancel` was called.
    Cancelled,
    /// The flow is persisted and the host was told how to wake it.
    Suspended,
    /// The flow is persisted until outstanding aggregate children report.
    Waiting,
    /// A late `WhenAny` child finished after its aggregate was resolved.
    Discarded,
}

enum ChainEnd {
    Completed {
        outcome: Outcome,
        parent: Option<FlowId>,
    },
    Suspended,
    Parked,
}

struct Session<'h> {
    host: &'h dyn FlowHost,
    state: Box<dyn StateManager>,
    provider: Arc<dyn CancellationProvider>,
    cancellation: Arc<CancellationSource>,
    handler: Arc<dyn CancellationHandler>,
    suspended: Vec<(FlowId, Suspension)>,
}

impl<'h> Session<'h> {
    fn open(host: &'h dyn FlowHost, id: FlowId) -> Self {
        let cancellation = CancellationSource::new(CancellationId::for_flow(id));
        let handler: Arc<dyn CancellationHandler> = cancellation.clone();
        let provider = host.cancellation_provider();
        provider.register_handler(Arc::clone(&handler));
        let state = host.create_state_manager(host.create_marshaler());
        Self {
            host,
            state,
            provider,
            cancellation,
            handler,
            suspended: Vec::new(),
        }
    }

    fn close(self) {
        self.provider.unregister_handler(&self.handler);
    }
}

/// Drives one flow at a time through its activations.
#[derive(Debug, Default)]
pub struct FlowDriver {
    state: FlowState,
    flow_id: Option<FlowId>,
    steps: u64,
}

impl FlowDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// The flow this driver is assigned to, if any.
    pub fn flow_id(&self) -> Option<FlowId> {
        self.flow_id
    }

    /// Activation steps executed by the last `start`/`resume`.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub(crate) fn assign(&mut self, id: FlowId) {
        debug_assert_eq!(self.state, FlowState::Idling, "assigning a busy driver");
        self.state = FlowState::Pending;
        self.flow_id = Some(id);
    }

    /// Return every field to its default before pooling.
    pub(crate) fn reset(&mut self) {
        self.detach();
        self.steps = 0;
    }

    fn detach(&mut self) {
        self.state = FlowState::Idling;
        self.flow_id = None;
    }

    fn claim(&mut self, id: FlowId) -> Result<(), FlowError> {
        match (self.state, self.flow_id) {
            (FlowState::Idling, _) => {
                self.assign(id);
                self.steps = 0;
                Ok(())
            }
            (FlowState::Pending, Some(assigned)) if assigned == id => {
                self.steps = 0;
                Ok(())
            }
            (state, _) => Err(FlowError::Protocol(format!(
                "driver in state {} cannot take flow '{}'",
                state, id
            ))),
        }
    }

    fn transition(&mut self, next: FlowState) {
        if self.state != next {
            tracing::trace!(from = %self.state, to = %next, "Driver transition");
            self.state = next;
        }
    }

    /// Run a new flow from its first step.
    ///
    /// # Errors
    ///
    /// Storage, codec and marshaling failures surface here; the flow's own
    /// faults are reported to the host instead.
    pub async fn start(
        &mut self,
        host: &dyn FlowHost,
        id: FlowId,
        op: Box<dyn Resumable>,
    ) -> Result<FlowStatus, FlowError> {
        self.claim(id)?;
        tracing::debug!(flow_id = %id, op = op.type_name(), "Starting flow");

        let mut session = Session::open(host, id);
        let root = Activation::new(id, op);
        let result = match self.run_chain(&mut session, id, vec![root], None, None).await {
            Ok(end) => self.settle(&mut session, id, end).await,
            Err(e) => Err(e),
        };
        let result = self.finish(&mut session, result).await;
        session.close();
        self.detach();
        result
    }

    /// Resume a suspended flow or aggregate child with `input`.
    ///
    /// Missing or corrupted state is reported to the host's `on_fail` and
    /// yields [`FlowStatus::Failed`].
    pub async fn resume(
        &mut self,
        host: &dyn FlowHost,
        id: FlowId,
        input: ResumeInput,
    ) -> Result<FlowStatus, FlowError> {
        self.claim(id)?;
        tracing::debug!(flow_id = %id, "Resuming flow");

        let mut session = Session::open(host, id);
        let result = match self.resume_in(&mut session, id, input).await {
            Err(FlowError::CorruptedFlow(corrupted)) => {
                tracing::error!(flow_id = %id, corrupted = %corrupted, "Flow data missing or corrupted");
                let fault = Fault::from(FlowError::CorruptedFlow(corrupted));
                self.transition(FlowState::Returning);
                host.on_fail(id, fault)
                    .await
                    .map(|_| FlowStatus::Failed)
                    .map_err(FlowError::Host)
            }
            other => other,
        };
        let result = self.finish(&mut session, result).await;
        session.close();
        self.detach();
        result
    }

    async fn resume_in(
        &mut self,
        s: &mut Session<'_>,
        id: FlowId,
        input: ResumeInput,
    ) -> Result<FlowStatus, FlowError> {
        self.transition(FlowState::Hydrating);
        let runnable = s.state.hydrate(id, input).await?;
        if let Some(AwaitRecord::Aggregate { id: aggregate }) = &runnable.activation.awaiting {
            return Err(FlowError::Protocol(format!(
                "flow '{}' is waiting on aggregate '{}' and cannot be resumed directly",
                id, aggregate
            )));
        }
        let end = self
            .run_chain(
                s,
                id,
                vec![runnable.activation],
                Some(runnable.input),
                runnable.parent_id,
            )
            .await?;
        self.settle(s, id, end).await
    }

    fn run_chain<'a, 'h>(
        &'a mut self,
        s: &'a mut Session<'h>,
        key: FlowId,
        mut stack: Vec<Activation>,
        mut input: Option<Outcome>,
        mut parent: Option<FlowId>,
    ) -> BoxFuture<'a, Result<ChainEnd, FlowError>> {
        Box::pin(async move {
            loop {
                if stack.is_empty() {
                    let outcome = input.take().unwrap_or(Ok(Value::Null));
                    if s.state.pending_frames(key) == 0 {
                        return Ok(ChainEnd::Completed { outcome, parent });
                    }
                    self.transition(FlowState::Hydrating);
                    let runnable = s.state.hydrate(key, ResumeInput::from(outcome)).await?;
                    if runnable.parent_id.is_some() {
                        parent = runnable.parent_id;
                    }
                    stack.push(runnable.activation);
                    input = Some(runnable.input);
                    continue;
                }

                self.transition(FlowState::Running);
                let depth = stack.len() - 1;
                let step = {
                    let top = &mut stack[depth];
                    let mut cx = StepContext::new(key, top.id, Some(s.cancellation.as_ref()));
                    top.op.resume(&mut cx, input.take())
                };
                self.steps += 1;

                let (kind, ops) = match step {
                    Step::Return(value) => {
                        stack.pop();
                        input = Some(Ok(value));
                        continue;
                    }
                    Step::Fail(fault) => {
                        stack.pop();
                        input = Some(Err(fault));
                        continue;
                    }
                    Step::Await(Await::Call(op)) => {
                        let child = FlowId::new_operation();
                        stack[depth].awaiting = Some(AwaitRecord::Call { id: child });
                        stack.push(Activation::new(child, op));
                        continue;
                    }
                    Step::Await(Await::Bridge(future)) => {
                        self.transition(FlowState::Awaiting);
                        let cancellation = Arc::clone(&s.cancellation);
                        input = Some(tokio::select! {
                            outcome = future => outcome,
                            _ = cancellation.cancelled() => Err(Fault::cancelled(format!(
                                "flow '{}' was cancelled while awaiting", key
                            ))),
                        });
                        continue;
                    }
                    Step::Await(Await::Suspend(suspension)) => {
                        if s.cancellation.is_cancelled() {
                            input = Some(Err(Fault::cancelled(format!(
                                "flow '{}' was cancelled before suspending",
                                key
                            ))));
                            continue;
                        }
                        stack[depth].awaiting = Some(AwaitRecord::Suspension);
                        self.capture(s, key, &stack)?;
                        s.state.flush().await?;
                        tracing::debug!(flow_id = %key, suspension = ?suspension, frames = stack.len(), "Flow suspended");
                        s.suspended.push((key, suspension));
                        return Ok(ChainEnd::Suspended);
                    }
                    Step::Await(Await::WhenAll(ops)) => (AggregateKind::All, ops),
                    Step::Await(Await::WhenAny(ops)) => (AggregateKind::Any, ops),
                };

                self.transition(FlowState::Aggregating);
                let aggregate = FlowId::new_operation();
                stack[depth].awaiting = Some(AwaitRecord::Aggregate { id: aggregate });
                match self.aggregate(s, key, aggregate, kind, ops).await? {
                    Some(outcome) => input = Some(outcome),
                    None => {
                        self.capture(s, key, &stack)?;
                        s.state.flush().await?;
                        tracing::debug!(flow_id = %key, aggregate_id = %aggregate, "Flow waiting on aggregate");
                        return Ok(ChainEnd::Parked);
                    }
                }
            }
        })
    }

    fn aggregate<'a, 'h>(
        &'a mut self,
        s: &'a mut Session<'h>,
        owner: FlowId,
        id: FlowId,
        kind: AggregateKind,
        ops: Vec<Box<dyn Resumable>>,
    ) -> BoxFuture<'a, Result<Option<Outcome>, FlowError>> {
        Box::pin(async move {
            if kind == AggregateKind::Any && ops.is_empty() {
                return Ok(Some(Err(Fault::failed("WhenAny needs at least one operation"))));
            }

            let children: Vec<FlowId> = ops.iter().map(|_| FlowId::new_operation()).collect();
            let mut record = AggregateRecord::new(id, kind, owner, children.clone());
            let mut resolved = record.resolve();
            tracing::debug!(flow_id = %owner, aggregate_id = %id, kind = ?kind, children = children.len(), "Running aggregate");

            for (child, op) in children.into_iter().zip(ops) {
                let root = Activation::child_of(id, child, op);
                let end = self.run_chain(s, child, vec![root], None, Some(id)).await?;
                self.transition(FlowState::Aggregating);
                if let ChainEnd::Completed { outcome, .. } = end {
                    if resolved.is_some() {
                        tracing::trace!(aggregate_id = %id, child = %child, "Discarding outcome of resolved aggregate");
                        continue;
                    }
                    record.record(child, outcome);
                    resolved = record.resolve();
                }
            }

            if resolved.is_none() {
                s.state.save_aggregate(record);
            }
            Ok(resolved)
        })
    }

    /// Buffer every live activation of chain `key`, bottom to top. The
    /// caller flushes.
    fn capture(
        &mut self,
        s: &mut Session<'_>,
        key: FlowId,
        stack: &[Activation],
    ) -> Result<(), FlowError> {
        self.transition(FlowState::Dehydrating);
        for activation in stack {
            s.state.dehydrate(activation.parent, key, activation)?;
        }
        self.transition(FlowState::Awaiting);
        Ok(())
    }

    /// Walk completed chains up through their aggregates until something
    /// suspends, parks, or the root completes.
    async fn settle(
        &mut self,
        s: &mut Session<'_>,
        mut key: FlowId,
        mut end: ChainEnd,
    ) -> Result<FlowStatus, FlowError> {
        loop {
            let (outcome, parent) = match end {
                ChainEnd::Suspended => return Ok(FlowStatus::Suspended),
                ChainEnd::Parked => return Ok(FlowStatus::Waiting),
                ChainEnd::Completed { outcome, parent } => (outcome, parent),
            };
            s.state.delete(key);

            let Some(aggregate) = parent else {
                self.transition(FlowState::Awaiting);
                s.state.flush().await?;
                return self.report(s.host, key, outcome).await;
            };

            self.transition(FlowState::Aggregating);
            let Some(mut record) = s.state.load_aggregate(aggregate).await? else {
                tracing::debug!(flow_id = %key, aggregate_id = %aggregate, "Aggregate already resolved, discarding outcome");
                s.state.flush().await?;
                return Ok(FlowStatus::Discarded);
            };
            if !record.record(key, outcome) {
                return Err(FlowError::Protocol(format!(
                    "chain '{}' is not an open child of aggregate '{}'",
                    key, aggregate
                )));
            }
            let Some(resolved) = record.resolve() else {
                tracing::debug!(flow_id = %key, aggregate_id = %aggregate, pending = record.pending(), "Aggregate still pending");
                s.state.save_aggregate(record);
                s.state.flush().await?;
                return Ok(FlowStatus::Waiting);
            };

            s.state.delete_aggregate(aggregate);
            let owner = record.owner;
            self.transition(FlowState::Hydrating);
            let runnable = s.state.hydrate(owner, ResumeInput::from(resolved)).await?;
            if runnable.activation.awaiting != Some(AwaitRecord::Aggregate { id: aggregate }) {
                return Err(FlowError::Protocol(format!(
                    "top frame of '{}' is not waiting on aggregate '{}'",
                    owner, aggregate
                )));
            }
            end = self
                .run_chain(
                    s,
                    owner,
                    vec![runnable.activation],
                    Some(runnable.input),
                    runnable.parent_id,
                )
                .await?;
            key = owner;
        }
    }

    async fn report(
        &mut self,
        host: &dyn FlowHost,
        id: FlowId,
        outcome: Outcome,
    ) -> Result<FlowStatus, FlowError> {
        self.transition(FlowState::Returning);
        let status = match outcome {
            Ok(value) => {
                tracing::debug!(flow_id = %id, "Flow succeeded");
                host.on_succeed(id, value).await.map_err(FlowError::Host)?;
                FlowStatus::Succeeded
            }
            Err(fault) if fault.is_cancellation() => {
                tracing::debug!(flow_id = %id, "Flow cancelled");
                host.on_cancel(id, fault).await.map_err(FlowError::Host)?;
                FlowStatus::Cancelled
            }
            Err(fault) => {
                tracing::debug!(flow_id = %id, fault = %fault, "Flow failed");
                host.on_fail(id, fault).await.map_err(FlowError::Host)?;
                FlowStatus::Failed
            }
        };
        Ok(status)
    }

    /// Tell the host how to wake every chain persisted during this run.
    ///
    /// Runs last so no wake-up can race ahead of state that is still being
    /// written. A failed run wakes nothing: chains it persisted may belong to
    /// an aggregate or owner that never reached storage, so everything the
    /// run created is removed and the error is returned.
    async fn finish(
        &mut self,
        s: &mut Session<'_>,
        result: Result<FlowStatus, FlowError>,
    ) -> Result<FlowStatus, FlowError> {
        let suspended = std::mem::take(&mut s.suspended);
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, dropped_wakeups = suspended.len(), "Run failed, rolling back");
                s.state.rollback();
                if let Err(cleanup) = s.state.flush().await {
                    tracing::error!(error = %cleanup, "Rollback failed");
                }
                return Err(e);
            }
        };
        if !suspended.is_empty() {
            self.transition(FlowState::Suspending);
        }
        let mut notify_error = None;
        for (id, suspension) in suspended {
            let notified = match suspension {
                Suspension::Yield => s.host.on_yield(id).await,
                Suspension::Delay(delay) => s.host.on_delay(id, delay).await,
                Suspension::Callback(callback) => s.host.on_suspended(id, callback).await,
            };
            if let Err(e) = notified {
                tracing::error!(flow_id = %id, error = %e, "Suspension callback failed");
                notify_error.get_or_insert(FlowError::Host(e));
            }
        }
        match notify_error {
            Some(e) => Err(e),
            None => Ok(status),
        }
    }
}
