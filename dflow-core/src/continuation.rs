//! Resumable activations and their capture.
//!
//! A durable flow is a stack of [`Resumable`] activations. Each call to
//! [`Resumable::resume`] runs the activation up to its next await point and
//! returns a [`Step`] saying what happens next. When the flow must leave
//! memory, every activation on the stack is captured field by field through a
//! [`Deconstructor`], and later rebuilt through a [`Reconstructor`] by the
//! factory registered for its type.

use crate::context::StepContext;
use crate::error::{Fault, FlowError, Outcome};
use crate::id::FlowId;
use crate::marshal::{
    Marshaler, Reference, RestorationAction, SurrogateConverter, SurrogationAction,
};
use crate::record::{FrameRecord, HeapSnapshot, Slot};
use crate::types::TypeId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId as RuntimeTypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A step-wise computation that can be suspended and rebuilt.
pub trait Resumable: Send + 'static {
    /// Run until the next await point.
    ///
    /// `input` is `None` on first entry and otherwise carries the outcome of
    /// whatever the previous step awaited.
    fn resume(&mut self, cx: &mut StepContext<'_>, input: Option<Outcome>) -> Step;

    /// Capture the live state needed to resume from the current point.
    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError>;

    /// Runtime type used to find the registered persistable id and factory.
    fn type_key(&self) -> RuntimeTypeId {
        RuntimeTypeId::of::<Self>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Rebuilds a [`Resumable`] from its captured state.
pub trait Reconstruct: Resumable + Sized {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError>;
}

/// Invoked once the flow's state is durably stored, to arrange a wake-up.
#[async_trait]
pub trait SuspensionCallback: Send + Sync {
    async fn on_suspended(&self, id: FlowId) -> anyhow::Result<()>;
}

/// Why a flow is leaving memory.
#[derive(Clone)]
pub enum Suspension {
    /// Resume as soon as the host gets to it.
    Yield,
    /// Resume after the given delay.
    Delay(Duration),
    /// Resume when some external party resumes it; the callback is told the
    /// id to resume.
    Callback(Arc<dyn SuspensionCallback>),
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspension::Yield => f.write_str("Yield"),
            Suspension::Delay(d) => f.debug_tuple("Delay").field(d).finish(),
            Suspension::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// What a step is waiting on.
pub enum Await {
    /// A nested activation, run on the same stack.
    Call(Box<dyn Resumable>),
    /// A host-level suspension.
    Suspend(Suspension),
    /// A plain future. It runs in memory; the flow can't suspend inside it.
    Bridge(BoxFuture<'static, Outcome>),
    /// Every child, each on its own chain. Completes with an array of results
    /// in input order, or with every fault collected.
    WhenAll(Vec<Box<dyn Resumable>>),
    /// The first child to complete wins; the others still run to completion
    /// and their outcomes are discarded.
    WhenAny(Vec<Box<dyn Resumable>>),
}

impl fmt::Debug for Await {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Await::Call(op) => f.debug_tuple("Call").field(&op.type_name()).finish(),
            Await::Suspend(s) => f.debug_tuple("Suspend").field(s).finish(),
            Await::Bridge(_) => f.write_str("Bridge"),
            Await::WhenAll(ops) => f.debug_tuple("WhenAll").field(&ops.len()).finish(),
            Await::WhenAny(ops) => f.debug_tuple("WhenAny").field(&ops.len()).finish(),
        }
    }
}

/// Result of running one step of an activation.
#[derive(Debug)]
pub enum Step {
    Return(Value),
    Fail(Fault),
    Await(Await),
}

impl Step {
    /// Return a serializable value. Serialization failure becomes a fault.
    pub fn ret<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Step::Return(value),
            Err(e) => Step::Fail(Fault::failed(format!("result is not serializable: {}", e))),
        }
    }

    pub fn fail(fault: impl Into<Fault>) -> Self {
        Step::Fail(fault.into())
    }

    /// Pass an awaited outcome through unchanged.
    pub fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Ok(value) => Step::Return(value),
            Err(fault) => Step::Fail(fault),
        }
    }

    pub fn call(op: impl Resumable) -> Self {
        Step::Await(Await::Call(Box::new(op)))
    }

    pub fn yield_now() -> Self {
        Step::Await(Await::Suspend(Suspension::Yield))
    }

    pub fn delay(delay: Duration) -> Self {
        Step::Await(Await::Suspend(Suspension::Delay(delay)))
    }

    pub fn suspend(callback: Arc<dyn SuspensionCallback>) -> Self {
        Step::Await(Await::Suspend(Suspension::Callback(callback)))
    }

    pub fn bridge<F>(future: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        Step::Await(Await::Bridge(Box::pin(future)))
    }

    pub fn when_all(ops: Vec<Box<dyn Resumable>>) -> Self {
        Step::Await(Await::WhenAll(ops))
    }

    pub fn when_any(ops: Vec<Box<dyn Resumable>>) -> Self {
        Step::Await(Await::WhenAny(ops))
    }
}

/// Decode an awaited value, turning a type mismatch into a fault.
pub fn decode_outcome<T: DeserializeOwned>(input: Option<Outcome>) -> Result<T, Fault> {
    let value = input.ok_or_else(|| Fault::failed("expected an awaited result"))??;
    serde_json::from_value(value).map_err(|e| Fault::failed(format!("unexpected result shape: {}", e)))
}

#[derive(Default)]
struct CaptureSurrogate(Option<(TypeId, Value)>);

impl SurrogationAction for CaptureSurrogate {
    fn surrogate_as(&mut self, type_id: &TypeId, token: Value) {
        self.0 = Some((type_id.clone(), token));
    }
}

/// Collects the fields of one activation into a frame.
pub struct Deconstructor<'a> {
    resume_point: u32,
    slots: BTreeMap<String, Slot>,
    heap: &'a mut HeapSnapshot,
    marshaler: &'a dyn Marshaler,
}

impl<'a> Deconstructor<'a> {
    pub fn new(heap: &'a mut HeapSnapshot, marshaler: &'a dyn Marshaler) -> Self {
        Self {
            resume_point: 0,
            slots: BTreeMap::new(),
            heap,
            marshaler,
        }
    }

    /// Record where execution continues.
    pub fn resume_point(&mut self, point: u32) {
        self.resume_point = point;
    }

    /// Capture a serializable field.
    pub fn field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<(), FlowError> {
        let value = serde_json::to_value(value)?;
        self.slots.insert(name.to_string(), Slot::Value { value });
        Ok(())
    }

    /// Capture a live reference through the marshaler.
    ///
    /// # Errors
    ///
    /// [`FlowError::NotMarshalable`] when no surrogate is in scope for
    /// `value`.
    pub fn reference<T: Any + Send + Sync>(&mut self, name: &str, value: &Arc<T>) -> Result<(), FlowError> {
        let reference: Reference = value.clone();
        let mut captured = CaptureSurrogate::default();
        let found = self.marshaler.try_surrogate(&reference, &mut captured);
        match (found, captured.0) {
            (true, Some((type_id, token))) => {
                self.slots
                    .insert(name.to_string(), Slot::Surrogate { type_id, token });
                Ok(())
            }
            _ => Err(FlowError::NotMarshalable(name.to_string())),
        }
    }

    /// Capture a value shared by every frame of the stack.
    pub fn shared<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<(), FlowError> {
        self.heap
            .shared
            .insert(name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn into_parts(self) -> (u32, BTreeMap<String, Slot>) {
        (self.resume_point, self.slots)
    }
}

struct RestoreFromToken {
    token: Value,
    restored: Option<Result<Reference, FlowError>>,
}

impl RestorationAction for RestoreFromToken {
    fn restore_as(&mut self, _: &TypeId, converter: &dyn SurrogateConverter) {
        self.restored = Some(converter.convert(self.token.clone()));
    }
}

/// Reads the captured fields of one frame back.
pub struct Reconstructor<'a> {
    frame: &'a FrameRecord,
    heap: &'a HeapSnapshot,
    marshaler: &'a dyn Marshaler,
}

impl<'a> Reconstructor<'a> {
    pub fn new(frame: &'a FrameRecord, heap: &'a HeapSnapshot, marshaler: &'a dyn Marshaler) -> Self {
        Self {
            frame,
            heap,
            marshaler,
        }
    }

    pub fn id(&self) -> FlowId {
        self.frame.id
    }

    pub fn resume_point(&self) -> u32 {
        self.frame.resume_point
    }

    fn slot(&self, name: &str) -> Result<&'a Slot, FlowError> {
        self.frame
            .slots
            .get(name)
            .ok_or_else(|| FlowError::MissingSlot(name.to_string()))
    }

    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T, FlowError> {
        match self.slot(name)? {
            Slot::Value { value } => Ok(serde_json::from_value(value.clone())?),
            Slot::Surrogate { type_id, .. } => Err(FlowError::Protocol(format!(
                "slot '{}' holds a '{}' surrogate, not a value",
                name, type_id
            ))),
        }
    }

    pub fn optional_field<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, FlowError> {
        if !self.frame.slots.contains_key(name) {
            return Ok(None);
        }
        self.field(name).map(Some)
    }

    /// Restore a live reference captured with [`Deconstructor::reference`].
    pub fn reference<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, FlowError> {
        let (type_id, token) = match self.slot(name)? {
            Slot::Surrogate { type_id, token } => (type_id, token),
            Slot::Value { .. } => {
                return Err(FlowError::Protocol(format!(
                    "slot '{}' holds a value, not a surrogate",
                    name
                )));
            }
        };

        let mut action = RestoreFromToken {
            token: token.clone(),
            restored: None,
        };
        if !self
            .marshaler
            .try_restore(type_id, RuntimeTypeId::of::<T>(), &mut action)
        {
            return Err(FlowError::UnknownType(type_id.to_string()));
        }
        let reference = action
            .restored
            .ok_or_else(|| FlowError::Protocol(format!("surrogate '{}' was not restored", type_id)))??;
        reference.downcast::<T>().map_err(|_| {
            FlowError::Protocol(format!(
                "surrogate '{}' restored to a type other than {}",
                type_id,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn shared<T: DeserializeOwned>(&self, name: &str) -> Result<T, FlowError> {
        let value = self
            .heap
            .shared
            .get(name)
            .ok_or_else(|| FlowError::MissingSlot(name.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}
