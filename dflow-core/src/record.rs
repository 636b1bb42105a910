//! Persisted shapes of suspended activations.

use crate::id::FlowId;
use crate::types::TypeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// What a persisted activation was waiting on when it was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AwaitRecord {
    /// A child activation that sits above this one on the same stack.
    Call { id: FlowId },
    /// A host-level suspension (yield, delay, callback).
    Suspension,
    /// A `WhenAll`/`WhenAny` whose children run as separate chains.
    Aggregate { id: FlowId },
}

/// One captured field of an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Slot {
    /// A plain serializable value.
    Value { value: Value },
    /// A reference replaced by a surrogate token.
    Surrogate { type_id: TypeId, token: Value },
}

impl Slot {
    pub fn value(value: Value) -> Self {
        Slot::Value { value }
    }
}

/// The serialized form of one suspended activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub id: FlowId,
    /// Set on the bottom frame of a chain spawned by an aggregate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<FlowId>,
    pub type_id: TypeId,
    pub resume_point: u32,
    pub awaiting: AwaitRecord,
    #[serde(default)]
    pub slots: BTreeMap<String, Slot>,
}

/// Values shared between the frames of one stack.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeapSnapshot {
    pub owner: FlowId,
    /// Number of persisted suspend cycles.
    pub cycles: u64,
    #[serde(default)]
    pub shared: BTreeMap<String, Value>,
}

impl HeapSnapshot {
    pub fn new(owner: FlowId) -> Self {
        Self {
            owner,
            cycles: 0,
            shared: BTreeMap::new(),
        }
    }
}
