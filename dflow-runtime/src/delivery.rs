//! Durable delivery of terminal outcomes.
//!
//! A flow's caller may be long gone by the time the flow completes. Instead
//! of holding a callback in memory, the caller registers a
//! [`ContinuationMemento`], a serializable description of what to do with
//! the outcome. When the flow ends the host restores the memento through a
//! [`ContinuationFactory`] and invokes the resulting [`FlowContinuation`].

use async_trait::async_trait;
use dflow_core::types::TypeId;
use dflow_core::{Fault, FlowError, FlowId, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Type id reserved for a memento that fans out to several others.
pub const AGGREGATE_CONTINUATION: &str = "dflow.aggregate";

/// Persisted form of a [`FlowContinuation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationMemento {
    pub type_id: TypeId,
    pub state: Value,
}

impl ContinuationMemento {
    pub fn new(type_id: impl Into<TypeId>, state: Value) -> Self {
        Self {
            type_id: type_id.into(),
            state,
        }
    }

    /// Memento for `state`, serialized with serde.
    pub fn from_state<S: Serialize>(type_id: impl Into<TypeId>, state: &S) -> Result<Self, FlowError> {
        Ok(Self::new(type_id, serde_json::to_value(state)?))
    }

    /// One memento that invokes every member, in order.
    pub fn aggregate(members: Vec<ContinuationMemento>) -> Result<Self, FlowError> {
        Self::from_state(AGGREGATE_CONTINUATION, &members)
    }
}

/// Receives the terminal outcome of a flow.
#[async_trait]
pub trait FlowContinuation: Send + Sync {
    async fn on_succeed(&self, id: FlowId, result: &Value) -> anyhow::Result<()>;

    async fn on_fail(&self, id: FlowId, fault: &Fault) -> anyhow::Result<()>;

    async fn on_cancel(&self, id: FlowId, fault: &Fault) -> anyhow::Result<()>;
}

/// Invokes each member in turn, stopping at the first error.
pub struct AggregateContinuation {
    members: Vec<Box<dyn FlowContinuation>>,
}

impl AggregateContinuation {
    pub fn new(members: Vec<Box<dyn FlowContinuation>>) -> Self {
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl FlowContinuation for AggregateContinuation {
    async fn on_succeed(&self, id: FlowId, result: &Value) -> anyhow::Result<()> {
        for member in &self.members {
            member.on_succeed(id, result).await?;
        }
        Ok(())
    }

    async fn on_fail(&self, id: FlowId, fault: &Fault) -> anyhow::Result<()> {
        for member in &self.members {
            member.on_fail(id, fault).await?;
        }
        Ok(())
    }

    async fn on_cancel(&self, id: FlowId, fault: &Fault) -> anyhow::Result<()> {
        for member in &self.members {
            member.on_cancel(id, fault).await?;
        }
        Ok(())
    }
}

type RestoreFn = Arc<dyn Fn(Value) -> Result<Box<dyn FlowContinuation>, FlowError> + Send + Sync>;

/// Turns mementos back into continuations.
#[derive(Default, Clone)]
pub struct ContinuationFactory {
    restorers: HashMap<TypeId, RestoreFn>,
}

impl ContinuationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore mementos of `type_id` by deserializing their state as `S`
    /// and passing it to `restore`.
    #[must_use]
    pub fn register<S, F>(mut self, type_id: impl Into<TypeId>, restore: F) -> Self
    where
        S: DeserializeOwned,
        F: Fn(S) -> Box<dyn FlowContinuation> + Send + Sync + 'static,
    {
        let restorer: RestoreFn = Arc::new(move |state: Value| {
            let state: S = serde_json::from_value(state)?;
            Ok(restore(state))
        });
        self.restorers.insert(type_id.into(), restorer);
        self
    }

    pub fn contains(&self, type_id: &TypeId) -> bool {
        type_id.as_str() == AGGREGATE_CONTINUATION || self.restorers.contains_key(type_id)
    }

    /// # Errors
    ///
    /// [`FlowError::UnknownType`] when no restorer is registered for the
    /// memento's type.
    pub fn restore(&self, memento: &ContinuationMemento) -> Result<Box<dyn FlowContinuation>, FlowError> {
        if memento.type_id.as_str() == AGGREGATE_CONTINUATION {
            let members: Vec<ContinuationMemento> = serde_json::from_value(memento.state.clone())?;
            let members = members
                .iter()
                .map(|m| self.restore(m))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Box::new(AggregateContinuation::new(members)));
        }
        let restorer = self.restorers.get(&memento.type_id).ok_or_else(|| {
            FlowError::UnknownType(format!("no continuation registered for '{}'", memento.type_id))
        })?;
        restorer(memento.state.clone())
    }
}
