use crate::cancellation::CancellationSource;
use crate::error::Fault;
use crate::id::FlowId;

/// What an activation can see of its surroundings while it runs one step.
pub struct StepContext<'a> {
    flow_id: FlowId,
    operation_id: FlowId,
    cancellation: Option<&'a CancellationSource>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        flow_id: FlowId,
        operation_id: FlowId,
        cancellation: Option<&'a CancellationSource>,
    ) -> Self {
        Self {
            flow_id,
            operation_id,
            cancellation,
        }
    }

    /// Id of the chain being driven.
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Id of the running activation.
    pub fn operation_id(&self) -> FlowId {
        self.operation_id
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_some_and(CancellationSource::is_cancelled)
    }

    /// `Err(Fault::Cancelled)` once cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), Fault> {
        if self.is_cancellation_requested() {
            return Err(Fault::cancelled(format!("flow '{}' was cancelled", self.flow_id)));
        }
        Ok(())
    }
}
