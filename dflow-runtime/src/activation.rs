use dflow_core::continuation::Resumable;
use dflow_core::record::AwaitRecord;
use dflow_core::{Fault, FlowId, Outcome, Value};
use std::fmt;

/// A live activation on a driver's stack.
pub struct Activation {
    /// Operation id of this activation.
    pub id: FlowId,
    /// Aggregate this activation's chain reports to. Only set on the bottom
    /// activation of a chain spawned by `WhenAll`/`WhenAny`.
    pub parent: Option<FlowId>,
    pub op: Box<dyn Resumable>,
    /// What the activation is blocked on, once it has awaited something.
    pub awaiting: Option<AwaitRecord>,
}

impl Activation {
    pub fn new(id: FlowId, op: Box<dyn Resumable>) -> Self {
        Self {
            id,
            parent: None,
            op,
            awaiting: None,
        }
    }

    /// Bottom activation of a chain owned by aggregate `parent`.
    pub fn child_of(parent: FlowId, id: FlowId, op: Box<dyn Resumable>) -> Self {
        Self {
            id,
            parent: Some(parent),
            op,
            awaiting: None,
        }
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("op", &self.op.type_name())
            .field("awaiting", &self.awaiting)
            .finish()
    }
}

/// What a resumed flow receives at its await point.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeInput {
    /// Plain wake-up: the awaited suspension is over.
    Trigger,
    /// The awaited work produced a value.
    Result(Value),
    /// The awaited work failed.
    Fault(Fault),
}

impl ResumeInput {
    pub fn into_outcome(self) -> Outcome {
        match self {
            ResumeInput::Trigger => Ok(Value::Null),
            ResumeInput::Result(value) => Ok(value),
            ResumeInput::Fault(fault) => Err(fault),
        }
    }
}

impl From<Outcome> for ResumeInput {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Ok(value) => ResumeInput::Result(value),
            Err(fault) => ResumeInput::Fault(fault),
        }
    }
}

/// A rebuilt activation ready to continue.
#[derive(Debug)]
pub struct Runnable {
    pub parent_id: Option<FlowId>,
    pub activation: Activation,
    pub input: Outcome,
}
