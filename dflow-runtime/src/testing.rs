//! Shared fixtures for the runtime's tests.

use crate::activation::ResumeInput;
use crate::driver::DriverPool;
use crate::host::FlowHost;
use crate::state::{DefaultStateManager, StateManager};
use async_trait::async_trait;
use dflow_core::cancellation::{CancellationProvider, InProcessCancellationProvider};
use dflow_core::context::StepContext;
use dflow_core::continuation::{
    Deconstructor, Reconstruct, Reconstructor, Resumable, Step, SuspensionCallback,
};
use dflow_core::marshal::{Marshaler, ScopedSurrogator};
use dflow_core::registry::DescriptorRegistry;
use dflow_core::serialization::JsonCodec;
use dflow_core::types::{TypeKey, TypeResolver};
use dflow_core::{Fault, FlowError, FlowId, Outcome, Value};
use dflow_persistence::{BackendError, FrameStack, InMemoryBackend, StackStorage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Succeeded(FlowId, Value),
    Failed(FlowId, Fault),
    Cancelled(FlowId, Fault),
    Yielded(FlowId),
    Delayed(FlowId, Duration),
    Suspended(FlowId),
}

pub(crate) fn registry() -> (TypeResolver, DescriptorRegistry) {
    DescriptorRegistry::builder()
        .keyed_operation::<Countdown>()
        .operation::<Caller>("tests.Caller")
        .operation::<Greeter>("tests.Greeter")
        .operation::<FanOut>("tests.FanOut")
        .operation::<Watcher>("tests.Watcher")
        .operation::<Approval>("tests.Approval")
        .operation::<Script>("tests.Script")
        .keyed_surrogate::<GreetingToken>()
        .build()
        .unwrap()
}

/// Records every callback; wake-ups are left for the test to deliver.
pub(crate) struct TestHost {
    pub backend: InMemoryBackend,
    stacks: Arc<dyn StackStorage>,
    pub surrogator: Arc<ScopedSurrogator>,
    pub cancellation: Arc<InProcessCancellationProvider>,
    resolver: Arc<TypeResolver>,
    descriptors: Arc<DescriptorRegistry>,
    events: Mutex<Vec<Event>>,
}

impl TestHost {
    pub fn new() -> Self {
        let (resolver, descriptors) = registry();
        let resolver = Arc::new(resolver);
        let backend = InMemoryBackend::new();
        Self {
            stacks: Arc::new(backend.clone()),
            backend,
            surrogator: ScopedSurrogator::root(Arc::clone(&resolver)),
            cancellation: Arc::new(InProcessCancellationProvider::new()),
            resolver,
            descriptors: Arc::new(descriptors),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Route stack writes through `stacks` instead of the shared backend.
    pub fn with_stacks(mut self, stacks: Arc<dyn StackStorage>) -> Self {
        self.stacks = stacks;
        self
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Remove pending yield/delay wake-ups, oldest first.
    pub fn take_wakeups(&self) -> Vec<FlowId> {
        let mut events = self.events.lock().unwrap();
        let mut wakeups = Vec::new();
        events.retain(|event| match event {
            Event::Yielded(id) | Event::Delayed(id, _) => {
                wakeups.push(*id);
                false
            }
            _ => true,
        });
        wakeups
    }

    pub fn outcome_of(&self, id: FlowId) -> Option<Outcome> {
        self.events.lock().unwrap().iter().find_map(|event| match event {
            Event::Succeeded(flow, value) if *flow == id => Some(Ok(value.clone())),
            Event::Failed(flow, fault) | Event::Cancelled(flow, fault) if *flow == id => {
                Some(Err(fault.clone()))
            }
            _ => None,
        })
    }
}

#[async_trait]
impl FlowHost for TestHost {
    fn type_resolver(&self) -> Arc<TypeResolver> {
        Arc::clone(&self.resolver)
    }

    fn cancellation_provider(&self) -> Arc<dyn CancellationProvider> {
        self.cancellation.clone()
    }

    fn create_marshaler(&self) -> Arc<dyn Marshaler> {
        Arc::new(ScopedSurrogator::child(&self.surrogator))
    }

    fn create_state_manager(&self, marshaler: Arc<dyn Marshaler>) -> Box<dyn StateManager> {
        Box::new(DefaultStateManager::new(
            Arc::clone(&self.stacks),
            Arc::new(self.backend.clone()),
            Arc::new(JsonCodec),
            marshaler,
            Arc::clone(&self.resolver),
            Arc::clone(&self.descriptors),
        ))
    }

    async fn on_succeed(&self, id: FlowId, result: Value) -> anyhow::Result<()> {
        self.push(Event::Succeeded(id, result));
        Ok(())
    }

    async fn on_fail(&self, id: FlowId, fault: Fault) -> anyhow::Result<()> {
        self.push(Event::Failed(id, fault));
        Ok(())
    }

    async fn on_cancel(&self, id: FlowId, fault: Fault) -> anyhow::Result<()> {
        self.push(Event::Cancelled(id, fault));
        Ok(())
    }

    async fn on_yield(&self, id: FlowId) -> anyhow::Result<()> {
        self.push(Event::Yielded(id));
        Ok(())
    }

    async fn on_delay(&self, id: FlowId, delay: Duration) -> anyhow::Result<()> {
        self.push(Event::Delayed(id, delay));
        Ok(())
    }

    async fn on_suspended(
        &self,
        id: FlowId,
        callback: Arc<dyn SuspensionCallback>,
    ) -> anyhow::Result<()> {
        self.push(Event::Suspended(id));
        callback.on_suspended(id).await
    }
}

/// Start `op` and deliver wake-ups until the flow reports a terminal outcome.
pub(crate) async fn drive_to_completion(
    host: &TestHost,
    op: Box<dyn Resumable>,
) -> Result<Outcome, FlowError> {
    let id = FlowId::new_flow();
    let mut pool = DriverPool::new();
    let mut driver = pool.acquire(id);
    driver.start(host, id, op).await?;
    pool.release(driver);

    loop {
        if let Some(outcome) = host.outcome_of(id) {
            return Ok(outcome);
        }
        let wakeups = host.take_wakeups();
        if wakeups.is_empty() {
            return Err(FlowError::Protocol(format!("flow '{}' stalled", id)));
        }
        for wakeup in wakeups {
            let mut driver = pool.acquire(wakeup);
            driver.resume(host, wakeup, ResumeInput::Trigger).await?;
            pool.release(driver);
        }
    }
}

/// Stack storage over an [`InMemoryBackend`] that accepts a fixed number of
/// writes and then fails every push and save.
pub(crate) struct FailingStacks {
    inner: InMemoryBackend,
    budget: AtomicUsize,
}

impl FailingStacks {
    pub fn new(inner: InMemoryBackend, budget: usize) -> Self {
        Self {
            inner,
            budget: AtomicUsize::new(budget),
        }
    }

    pub fn set_budget(&self, budget: usize) {
        self.budget.store(budget, Ordering::SeqCst);
    }

    fn spend(&self) -> Result<(), BackendError> {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| BackendError::Backend("disk full".into()))
    }
}

#[async_trait]
impl StackStorage for FailingStacks {
    async fn load_stack(&self, id: FlowId) -> Result<FrameStack, BackendError> {
        self.inner.load_stack(id).await
    }

    async fn save_stack(&self, id: FlowId, stack: &FrameStack) -> Result<(), BackendError> {
        self.spend()?;
        self.inner.save_stack(id, stack).await
    }

    async fn delete_stack(&self, id: FlowId) -> Result<(), BackendError> {
        self.inner.delete_stack(id).await
    }

    async fn push_frame(&self, id: FlowId, frame: bytes::Bytes) -> Result<(), BackendError> {
        self.spend()?;
        self.inner.push_frame(id, frame).await
    }

    async fn pop_frame(&self, id: FlowId) -> Result<Option<bytes::Bytes>, BackendError> {
        self.inner.pop_frame(id).await
    }
}

pub(crate) fn boxed<T: Resumable>(ops: Vec<T>) -> Vec<Box<dyn Resumable>> {
    ops.into_iter()
        .map(|op| Box::new(op) as Box<dyn Resumable>)
        .collect()
}

/// Yields `remaining` times, then returns how many times it yielded.
#[derive(Debug, Clone, Serialize, Deserialize, TypeKey)]
#[type_key = "tests.Countdown"]
pub(crate) struct Countdown {
    pub remaining: u32,
    pub ticks: u32,
}

impl Countdown {
    pub fn new(remaining: u32) -> Self {
        Self { remaining, ticks: 0 }
    }
}

impl Resumable for Countdown {
    fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
        if let Some(Err(fault)) = input {
            return Step::fail(fault);
        }
        if self.remaining == 0 {
            return Step::ret(&self.ticks);
        }
        self.remaining -= 1;
        self.ticks += 1;
        Step::yield_now()
    }

    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError> {
        d.resume_point(self.ticks);
        d.field("remaining", &self.remaining)?;
        d.field("ticks", &self.ticks)
    }
}

impl Reconstruct for Countdown {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError> {
        Ok(Self {
            remaining: r.field("remaining")?,
            ticks: r.resume_point(),
        })
    }
}

/// Calls a countdown and adds 100 to what it returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Caller {
    pub yields: u32,
    pub called: bool,
}

impl Resumable for Caller {
    fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
        if !self.called {
            self.called = true;
            return Step::call(Countdown::new(self.yields));
        }
        match dflow_core::continuation::decode_outcome::<u32>(input) {
            Ok(ticks) => Step::ret(&(ticks + 100)),
            Err(fault) => Step::fail(fault),
        }
    }

    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError> {
        d.resume_point(u32::from(self.called));
        d.field("yields", &self.yields)
    }
}

impl Reconstruct for Caller {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError> {
        Ok(Self {
            yields: r.field("yields")?,
            called: r.resume_point() == 1,
        })
    }
}

/// A live service a flow holds by reference.
#[derive(Debug)]
pub(crate) struct Greeting {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, TypeKey)]
#[type_key("tests.GreetingToken")]
pub(crate) struct GreetingToken(pub String);

/// Yields once, then greets through its service.
pub(crate) struct Greeter {
    pub greeting: Arc<Greeting>,
    pub name: String,
    pub yielded: bool,
}

impl Resumable for Greeter {
    fn resume(&mut self, _: &mut StepContext<'_>, _: Option<Outcome>) -> Step {
        if !self.yielded {
            self.yielded = true;
            return Step::yield_now();
        }
        Step::ret(&format!("{}, {}", self.greeting.text, self.name))
    }

    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError> {
        d.resume_point(u32::from(self.yielded));
        d.reference("greeting", &self.greeting)?;
        d.field("name", &self.name)
    }
}

impl Reconstruct for Greeter {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError> {
        Ok(Self {
            greeting: r.reference("greeting")?,
            name: r.field("name")?,
            yielded: r.resume_point() == 1,
        })
    }
}

/// Runs countdowns under `WhenAll` (or `WhenAny`) and returns the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FanOut {
    pub counts: Vec<u32>,
    pub any: bool,
    pub started: bool,
}

impl FanOut {
    pub fn all(counts: Vec<u32>) -> Self {
        Self {
            counts,
            any: false,
            started: false,
        }
    }

    pub fn any(counts: Vec<u32>) -> Self {
        Self {
            counts,
            any: true,
            started: false,
        }
    }
}

impl Resumable for FanOut {
    fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
        if self.started {
            return Step::from_outcome(input.unwrap_or(Ok(Value::Null)));
        }
        self.started = true;
        let children = boxed(self.counts.iter().map(|n| Countdown::new(*n)).collect());
        if self.any {
            Step::when_any(children)
        } else {
            Step::when_all(children)
        }
    }

    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError> {
        d.field("fan_out", self)
    }
}

impl Reconstruct for FanOut {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError> {
        r.field("fan_out")
    }
}

/// Awaits a future that never completes, then yields once more, then
/// returns whatever it was handed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Watcher {
    pub stage: u32,
}

impl Resumable for Watcher {
    fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
        self.stage += 1;
        match self.stage {
            1 => Step::bridge(futures::future::pending::<Outcome>()),
            2 => Step::delay(Duration::from_secs(3600)),
            _ => Step::from_outcome(input.unwrap_or(Ok(Value::Null))),
        }
    }

    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError> {
        d.resume_point(self.stage);
        Ok(())
    }
}

impl Reconstruct for Watcher {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError> {
        Ok(Self {
            stage: r.resume_point(),
        })
    }
}

struct Acknowledge;

#[async_trait]
impl SuspensionCallback for Acknowledge {
    async fn on_suspended(&self, id: FlowId) -> anyhow::Result<()> {
        tracing::debug!(flow_id = %id, "Waiting for approval");
        Ok(())
    }
}

/// Waits for an external resume and returns what it was resumed with.
#[derive(Debug, Clone, Default)]
pub(crate) struct Approval {
    pub asked: bool,
}

impl Resumable for Approval {
    fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
        if self.asked {
            return Step::from_outcome(input.unwrap_or(Ok(Value::Null)));
        }
        self.asked = true;
        Step::suspend(Arc::new(Acknowledge))
    }

    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError> {
        d.resume_point(u32::from(self.asked));
        Ok(())
    }
}

impl Reconstruct for Approval {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError> {
        Ok(Self {
            asked: r.resume_point() == 1,
        })
    }
}

/// One instruction of a [`Script`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Instr {
    Add(i64),
    Yield,
    Delay(u64),
    Fail,
    Call(Vec<Instr>),
    All(Vec<Vec<Instr>>),
    Any(Vec<Vec<Instr>>),
}

/// A tiny interpreter: adds numbers into an accumulator and folds in
/// whatever awaited work returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Script {
    program: Vec<Instr>,
    pc: usize,
    acc: i64,
}

impl Script {
    pub fn new(program: Vec<Instr>) -> Self {
        Self {
            program,
            pc: 0,
            acc: 0,
        }
    }

    fn children(programs: Vec<Vec<Instr>>) -> Vec<Box<dyn Resumable>> {
        boxed(programs.into_iter().map(Script::new).collect())
    }
}

fn absorb(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::Array(items) => items.iter().map(absorb).sum(),
        _ => 0,
    }
}

impl Resumable for Script {
    fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
        match input {
            Some(Err(fault)) => return Step::fail(fault),
            Some(Ok(value)) => self.acc += absorb(&value),
            None => {}
        }
        while let Some(instr) = self.program.get(self.pc).cloned() {
            self.pc += 1;
            match instr {
                Instr::Add(n) => self.acc += n,
                Instr::Yield => return Step::yield_now(),
                Instr::Delay(ms) => return Step::delay(Duration::from_millis(ms)),
                Instr::Fail => return Step::fail(Fault::failed(format!("failed at {}", self.pc - 1))),
                Instr::Call(program) => return Step::call(Script::new(program)),
                Instr::All(programs) => return Step::when_all(Self::children(programs)),
                Instr::Any(programs) => return Step::when_any(Self::children(programs)),
            }
        }
        Step::ret(&self.acc)
    }

    fn deconstruct(&self, d: &mut Deconstructor<'_>) -> Result<(), FlowError> {
        d.field("script", self)
    }
}

impl Reconstruct for Script {
    fn reconstruct(r: &Reconstructor<'_>) -> Result<Self, FlowError> {
        r.field("script")
    }
}
