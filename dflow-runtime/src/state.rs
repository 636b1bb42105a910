//! Dehydration and hydration of activation stacks.
//!
//! A [`StateManager`] turns live activations into frames on the way out and
//! frames back into activations on the way in. Writes are buffered: nothing
//! reaches storage until [`StateManager::flush`], so one suspend cycle lands
//! as one batch of stack, heap and record writes.

use crate::activation::{Activation, ResumeInput, Runnable};
use crate::aggregate::AggregateRecord;
use async_trait::async_trait;
use dflow_core::FlowError;
use dflow_core::FlowId;
use dflow_core::codec::{Decoder, Encoder, FrameCodec, sealed};
use dflow_core::continuation::{Deconstructor, Reconstructor};
use dflow_core::marshal::Marshaler;
use dflow_core::record::{FrameRecord, HeapSnapshot};
use dflow_core::registry::DescriptorRegistry;
use dflow_core::types::TypeResolver;
use dflow_persistence::{FrameStack, HeapStorage, StackStorage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A codec able to carry everything the engine persists.
pub trait StateCodec:
    FrameCodec + sealed::EncodeValue<AggregateRecord> + sealed::DecodeValue<AggregateRecord>
{
}

impl<U> StateCodec for U where
    U: FrameCodec + sealed::EncodeValue<AggregateRecord> + sealed::DecodeValue<AggregateRecord>
{
}

/// Moves activations between memory and storage for one driver run.
#[async_trait]
pub trait StateManager: Send {
    /// Capture `activation` as the new top frame of stack `id`.
    ///
    /// Only the in-memory buffer changes; call [`flush`](Self::flush) to
    /// persist.
    fn dehydrate(
        &mut self,
        parent_id: Option<FlowId>,
        id: FlowId,
        activation: &Activation,
    ) -> Result<(), FlowError>;

    /// Pop and rebuild the top frame of stack `id`, delivering `input` to it.
    ///
    /// # Errors
    ///
    /// [`FlowError::CorruptedFlow`] when the heap of `id` is missing or the
    /// stack has no frame left.
    async fn hydrate(&mut self, id: FlowId, input: ResumeInput) -> Result<Runnable, FlowError>;

    /// Frames of `id` still waiting in the buffer.
    fn pending_frames(&self, id: FlowId) -> usize;

    /// Drop all state of `id`.
    fn delete(&mut self, id: FlowId);

    async fn load_aggregate(&mut self, id: FlowId) -> Result<Option<AggregateRecord>, FlowError>;

    fn save_aggregate(&mut self, record: AggregateRecord);

    fn delete_aggregate(&mut self, id: FlowId);

    /// Forget every buffered change and schedule removal of every stack and
    /// aggregate record this manager created. The next
    /// [`flush`](Self::flush) performs the removal.
    fn rollback(&mut self);

    /// Write every buffered change to storage. Frames are pushed and popped
    /// individually; a stack that both lost and gained frames is replaced in
    /// one write.
    async fn flush(&mut self) -> Result<(), FlowError>;
}

struct Cycle {
    stack: FrameStack,
    heap: HeapSnapshot,
    dirty: bool,
    // Frames held by storage, and the lowest buffered depth since the last
    // flush. Storage frames above `floor` were popped here.
    stored: usize,
    floor: usize,
}

impl Cycle {
    fn fresh(id: FlowId) -> Self {
        Self {
            stack: FrameStack::new(),
            heap: HeapSnapshot::new(id),
            dirty: true,
            stored: 0,
            floor: 0,
        }
    }
}

/// [`StateManager`] over a [`StackStorage`] and a [`HeapStorage`].
///
/// Heap snapshots and aggregate records live in heap storage under
/// `{prefix}heap/{id}` and `{prefix}aggregate/{id}`.
pub struct DefaultStateManager<C> {
    stacks: Arc<dyn StackStorage>,
    heaps: Arc<dyn HeapStorage>,
    codec: Arc<C>,
    marshaler: Arc<dyn Marshaler>,
    resolver: Arc<TypeResolver>,
    descriptors: Arc<DescriptorRegistry>,
    key_prefix: String,
    cycles: HashMap<FlowId, Cycle>,
    deleted: HashSet<FlowId>,
    // Deleted and then recreated within one cycle; the old stack is replaced.
    purged: HashSet<FlowId>,
    aggregates: HashMap<FlowId, Option<AggregateRecord>>,
    created: HashSet<FlowId>,
    created_aggregates: HashSet<FlowId>,
    loaded_aggregates: HashSet<FlowId>,
}

impl<C: StateCodec> DefaultStateManager<C> {
    pub fn new(
        stacks: Arc<dyn StackStorage>,
        heaps: Arc<dyn HeapStorage>,
        codec: Arc<C>,
        marshaler: Arc<dyn Marshaler>,
        resolver: Arc<TypeResolver>,
        descriptors: Arc<DescriptorRegistry>,
    ) -> Self {
        Self {
            stacks,
            heaps,
            codec,
            marshaler,
            resolver,
            descriptors,
            key_prefix: String::new(),
            cycles: HashMap::new(),
            deleted: HashSet::new(),
            purged: HashSet::new(),
            aggregates: HashMap::new(),
            created: HashSet::new(),
            created_aggregates: HashSet::new(),
            loaded_aggregates: HashSet::new(),
        }
    }

    /// Namespace every heap storage key with `prefix`.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn heap_key(&self, id: FlowId) -> String {
        format!("{}heap/{}", self.key_prefix, id)
    }

    fn aggregate_key(&self, id: FlowId) -> String {
        format!("{}aggregate/{}", self.key_prefix, id)
    }

    async fn load_cycle(&mut self, id: FlowId) -> Result<(), FlowError> {
        if self.cycles.contains_key(&id) {
            return Ok(());
        }
        let Some(heap_bytes) = self.heaps.load(&self.heap_key(id)).await? else {
            tracing::warn!(flow_id = %id, "Heap missing on hydrate");
            return Err(FlowError::CorruptedFlow(id));
        };
        let heap: HeapSnapshot = self.codec.decode(heap_bytes).map_err(FlowError::Codec)?;
        let stack = self.stacks.load_stack(id).await?;
        tracing::trace!(flow_id = %id, frames = stack.len(), cycles = heap.cycles, "Loaded stack");
        let stored = stack.len();
        self.cycles.insert(
            id,
            Cycle {
                stack,
                heap,
                dirty: false,
                stored,
                floor: stored,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl<C: StateCodec> StateManager for DefaultStateManager<C> {
    fn dehydrate(
        &mut self,
        parent_id: Option<FlowId>,
        id: FlowId,
        activation: &Activation,
    ) -> Result<(), FlowError> {
        let awaiting = activation.awaiting.clone().ok_or_else(|| {
            FlowError::Protocol(format!(
                "activation {} dehydrated without an await point",
                activation.id
            ))
        })?;
        let type_id = self
            .resolver
            .get_type_id(activation.op.type_key())
            .map_err(|_| FlowError::UnknownType(activation.op.type_name().to_string()))?
            .clone();

        if self.deleted.remove(&id) {
            self.purged.insert(id);
        } else if !self.cycles.contains_key(&id) {
            self.created.insert(id);
        }
        let cycle = self.cycles.entry(id).or_insert_with(|| Cycle::fresh(id));

        let mut d = Deconstructor::new(&mut cycle.heap, self.marshaler.as_ref());
        activation.op.deconstruct(&mut d)?;
        let (resume_point, slots) = d.into_parts();

        let frame = FrameRecord {
            id: activation.id,
            parent: parent_id,
            type_id,
            resume_point,
            awaiting,
            slots,
        };
        let bytes = self.codec.encode(&frame).map_err(FlowError::Codec)?;
        cycle.stack.push(bytes);
        cycle.dirty = true;
        Ok(())
    }

    async fn hydrate(&mut self, id: FlowId, input: ResumeInput) -> Result<Runnable, FlowError> {
        self.load_cycle(id).await?;
        let cycle = self
            .cycles
            .get_mut(&id)
            .ok_or(FlowError::CorruptedFlow(id))?;
        let Some(bytes) = cycle.stack.pop() else {
            tracing::warn!(flow_id = %id, "Stack exhausted on hydrate");
            return Err(FlowError::CorruptedFlow(id));
        };
        cycle.dirty = true;
        cycle.floor = cycle.floor.min(cycle.stack.len());

        let frame: FrameRecord = self.codec.decode(bytes).map_err(FlowError::Codec)?;
        let runtime = self.resolver.get_type(&frame.type_id)?;
        let r = Reconstructor::new(&frame, &cycle.heap, self.marshaler.as_ref());
        let op = self.descriptors.reconstruct(runtime, &r)?;

        Ok(Runnable {
            parent_id: frame.parent,
            activation: Activation {
                id: frame.id,
                parent: frame.parent,
                op,
                awaiting: Some(frame.awaiting),
            },
            input: input.into_outcome(),
        })
    }

    fn pending_frames(&self, id: FlowId) -> usize {
        self.cycles.get(&id).map(|c| c.stack.len()).unwrap_or(0)
    }

    fn delete(&mut self, id: FlowId) {
        self.cycles.remove(&id);
        self.purged.remove(&id);
        self.deleted.insert(id);
    }

    fn rollback(&mut self) {
        self.cycles.clear();
        self.purged.clear();
        self.deleted = std::mem::take(&mut self.created);
        self.aggregates = std::mem::take(&mut self.created_aggregates)
            .into_iter()
            .map(|id| (id, None))
            .collect();
        tracing::debug!(
            chains = self.deleted.len(),
            aggregates = self.aggregates.len(),
            "Rolling back created state"
        );
    }

    async fn load_aggregate(&mut self, id: FlowId) -> Result<Option<AggregateRecord>, FlowError> {
        if let Some(buffered) = self.aggregates.get(&id) {
            return Ok(buffered.clone());
        }
        match self.heaps.load(&self.aggregate_key(id)).await? {
            Some(bytes) => {
                self.loaded_aggregates.insert(id);
                Ok(Some(self.codec.decode(bytes).map_err(FlowError::Codec)?))
            }
            None => Ok(None),
        }
    }

    fn save_aggregate(&mut self, record: AggregateRecord) {
        if !self.loaded_aggregates.contains(&record.id) {
            self.created_aggregates.insert(record.id);
        }
        self.aggregates.insert(record.id, Some(record));
    }

    fn delete_aggregate(&mut self, id: FlowId) {
        self.aggregates.insert(id, None);
    }

    async fn flush(&mut self) -> Result<(), FlowError> {
        for id in std::mem::take(&mut self.deleted) {
            tracing::trace!(flow_id = %id, "Deleting stack");
            self.stacks.delete_stack(id).await?;
            self.heaps.delete(&self.heap_key(id)).await?;
        }

        let dirty: Vec<FlowId> = self
            .cycles
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            let key = self.heap_key(id);
            let Some(cycle) = self.cycles.get_mut(&id) else {
                continue;
            };
            cycle.heap.cycles += 1;
            let heap = self.codec.encode(&cycle.heap).map_err(FlowError::Codec)?;
            self.heaps.save(&key, heap).await?;

            let popped = cycle.stored - cycle.floor;
            let pushed = &cycle.stack.frames()[cycle.floor..];
            if self.purged.contains(&id) || (popped > 0 && !pushed.is_empty()) {
                self.stacks.save_stack(id, &cycle.stack).await?;
            } else {
                for _ in 0..popped {
                    if self.stacks.pop_frame(id).await?.is_none() {
                        return Err(FlowError::CorruptedFlow(id));
                    }
                }
                for frame in pushed {
                    self.stacks.push_frame(id, frame.clone()).await?;
                }
            }
            self.purged.remove(&id);
            cycle.stored = cycle.stack.len();
            cycle.floor = cycle.stored;
            cycle.dirty = false;
            tracing::trace!(flow_id = %id, frames = cycle.stack.len(), "Flushed stack");
        }

        for (id, record) in std::mem::take(&mut self.aggregates) {
            let key = self.aggregate_key(id);
            match record {
                Some(record) => {
                    let bytes = self.codec.encode(&record).map_err(FlowError::Codec)?;
                    self.heaps.save(&key, bytes).await?;
                }
                None => self.heaps.delete(&key).await?,
            }
        }
        Ok(())
    }
}
