//! Completion policies for `WhenAll` and `WhenAny`.
//!
//! Each child of an aggregate runs as its own chain. Whenever a child chain
//! completes, its outcome is recorded here and the policy decides whether
//! the owner may continue. The same record serves children that complete in
//! memory and children that complete after a suspension, in which case it
//! is persisted between resumes.

use dflow_core::{Fault, FlowId, Outcome, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    /// Wait for every child.
    All,
    /// Take the first child to complete.
    Any,
}

/// Progress of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub id: FlowId,
    pub kind: AggregateKind,
    /// Chain holding the activation that awaits this aggregate.
    pub owner: FlowId,
    /// Child chain ids in input order.
    pub children: Vec<FlowId>,
    pub outcomes: Vec<Option<Outcome>>,
    /// Child indices in the order their outcomes arrived.
    #[serde(default)]
    pub arrivals: Vec<usize>,
}

impl AggregateRecord {
    pub fn new(id: FlowId, kind: AggregateKind, owner: FlowId, children: Vec<FlowId>) -> Self {
        let outcomes = vec![None; children.len()];
        Self {
            id,
            kind,
            owner,
            children,
            outcomes,
            arrivals: Vec::new(),
        }
    }

    /// Record the outcome of `child`.
    ///
    /// Returns `false` when `child` is not part of this aggregate or already
    /// reported.
    pub fn record(&mut self, child: FlowId, outcome: Outcome) -> bool {
        let Some(index) = self.children.iter().position(|c| *c == child) else {
            return false;
        };
        if self.outcomes[index].is_some() {
            return false;
        }
        self.outcomes[index] = Some(outcome);
        self.arrivals.push(index);
        true
    }

    /// Children that have not reported yet.
    pub fn pending(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_none()).count()
    }

    /// The aggregate's outcome, once the policy is satisfied.
    ///
    /// `All` yields the children's values in input order, or a
    /// [`Fault::Aggregate`] holding every fault in input order. `Any` yields
    /// the outcome of the first child to arrive.
    pub fn resolve(&self) -> Option<Outcome> {
        match self.kind {
            AggregateKind::All => {
                if self.pending() > 0 {
                    return None;
                }
                let mut values = Vec::with_capacity(self.outcomes.len());
                let mut faults = Vec::new();
                for outcome in self.outcomes.iter().flatten() {
                    match outcome {
                        Ok(value) => values.push(value.clone()),
                        Err(fault) => faults.push(fault.clone()),
                    }
                }
                if faults.is_empty() {
                    Some(Ok(Value::Array(values)))
                } else {
                    Some(Err(Fault::Aggregate { faults }))
                }
            }
            AggregateKind::Any => {
                let first = *self.arrivals.first()?;
                self.outcomes[first].clone()
            }
        }
    }
}
