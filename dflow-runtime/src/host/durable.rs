use super::{FlowHost, ManualScheduler, Scheduler};
use crate::delivery::{ContinuationFactory, ContinuationMemento, FlowContinuation};
use crate::state::{DefaultStateManager, StateCodec, StateManager};
use async_trait::async_trait;
use dflow_core::cancellation::{CancellationProvider, InProcessCancellationProvider};
use dflow_core::codec::sealed;
use dflow_core::marshal::{Marshaler, ScopedSurrogator};
use dflow_core::registry::DescriptorRegistry;
use dflow_core::types::TypeResolver;
use dflow_core::{Fault, FlowError, FlowId, Value};
use dflow_persistence::{HeapStorage, StackStorage};
use std::sync::Arc;
use std::time::Duration;

/// A codec able to carry everything a [`DurableHost`] persists.
pub trait DurableCodec:
    StateCodec
    + sealed::EncodeValue<ContinuationMemento>
    + sealed::DecodeValue<ContinuationMemento>
{
}

impl<U> DurableCodec for U where
    U: StateCodec
        + sealed::EncodeValue<ContinuationMemento>
        + sealed::DecodeValue<ContinuationMemento>
{
}

/// A ready-made [`FlowHost`] over pluggable storage.
///
/// Wake-ups go to a [`Scheduler`] and terminal outcomes go to the
/// continuation registered for the flow, if any. Continuations are stored
/// under `{prefix}continuation/{id}` next to the flows' heaps.
///
/// The host does not lease flows. Callers must keep at most one resume of a
/// given flow id in progress at a time.
pub struct DurableHost<C> {
    stacks: Arc<dyn StackStorage>,
    heaps: Arc<dyn HeapStorage>,
    codec: Arc<C>,
    resolver: Arc<TypeResolver>,
    descriptors: Arc<DescriptorRegistry>,
    surrogator: Arc<ScopedSurrogator>,
    cancellation: Arc<dyn CancellationProvider>,
    scheduler: Arc<dyn Scheduler>,
    continuations: ContinuationFactory,
    key_prefix: String,
}

impl<C: DurableCodec> DurableHost<C> {
    pub fn builder(
        stacks: Arc<dyn StackStorage>,
        heaps: Arc<dyn HeapStorage>,
        codec: Arc<C>,
        resolver: Arc<TypeResolver>,
        descriptors: Arc<DescriptorRegistry>,
    ) -> DurableHostBuilder<C> {
        DurableHostBuilder {
            stacks,
            heaps,
            codec,
            resolver,
            descriptors,
            surrogator: None,
            cancellation: None,
            scheduler: None,
            continuations: ContinuationFactory::new(),
            key_prefix: String::new(),
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The process-wide marshaling scope. Map long-lived services here.
    pub fn surrogator(&self) -> &Arc<ScopedSurrogator> {
        &self.surrogator
    }

    fn continuation_key(&self, id: FlowId) -> String {
        format!("{}continuation/{}", self.key_prefix, id)
    }

    /// Persist `memento` as the receiver of flow `id`'s terminal outcome.
    /// A later registration for the same flow replaces it.
    pub async fn register_continuation(
        &self,
        id: FlowId,
        memento: &ContinuationMemento,
    ) -> Result<(), FlowError> {
        if !self.continuations.contains(&memento.type_id) {
            return Err(FlowError::UnknownType(format!(
                "no continuation registered for '{}'",
                memento.type_id
            )));
        }
        let bytes = self.codec.encode(memento).map_err(FlowError::Codec)?;
        self.heaps.save(&self.continuation_key(id), bytes).await?;
        tracing::debug!(flow_id = %id, continuation = %memento.type_id, "Continuation registered");
        Ok(())
    }

    async fn load_continuation(&self, id: FlowId) -> anyhow::Result<Option<Box<dyn FlowContinuation>>> {
        let Some(bytes) = self.heaps.load(&self.continuation_key(id)).await? else {
            tracing::debug!(flow_id = %id, "No continuation registered, outcome dropped");
            return Ok(None);
        };
        let memento: ContinuationMemento = self.codec.decode(bytes)?;
        Ok(Some(self.continuations.restore(&memento)?))
    }

    async fn release_continuation(&self, id: FlowId) -> anyhow::Result<()> {
        self.heaps.delete(&self.continuation_key(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl<C: DurableCodec> FlowHost for DurableHost<C> {
    fn type_resolver(&self) -> Arc<TypeResolver> {
        Arc::clone(&self.resolver)
    }

    fn cancellation_provider(&self) -> Arc<dyn CancellationProvider> {
        Arc::clone(&self.cancellation)
    }

    fn create_marshaler(&self) -> Arc<dyn Marshaler> {
        Arc::new(ScopedSurrogator::child(&self.surrogator))
    }

    fn create_state_manager(&self, marshaler: Arc<dyn Marshaler>) -> Box<dyn StateManager> {
        Box::new(
            DefaultStateManager::new(
                Arc::clone(&self.stacks),
                Arc::clone(&self.heaps),
                Arc::clone(&self.codec),
                marshaler,
                Arc::clone(&self.resolver),
                Arc::clone(&self.descriptors),
            )
            .with_key_prefix(self.key_prefix.clone()),
        )
    }

    async fn on_succeed(&self, id: FlowId, result: Value) -> anyhow::Result<()> {
        if let Some(continuation) = self.load_continuation(id).await? {
            continuation.on_succeed(id, &result).await?;
            self.release_continuation(id).await?;
        }
        Ok(())
    }

    async fn on_fail(&self, id: FlowId, fault: Fault) -> anyhow::Result<()> {
        if let Some(continuation) = self.load_continuation(id).await? {
            continuation.on_fail(id, &fault).await?;
            self.release_continuation(id).await?;
        }
        Ok(())
    }

    async fn on_cancel(&self, id: FlowId, fault: Fault) -> anyhow::Result<()> {
        if let Some(continuation) = self.load_continuation(id).await? {
            continuation.on_cancel(id, &fault).await?;
            self.release_continuation(id).await?;
        }
        Ok(())
    }

    async fn on_yield(&self, id: FlowId) -> anyhow::Result<()> {
        self.scheduler.schedule_yield(id).await
    }

    async fn on_delay(&self, id: FlowId, delay: Duration) -> anyhow::Result<()> {
        self.scheduler.schedule_delay(id, delay).await
    }
}

/// Builder for [`DurableHost`].
pub struct DurableHostBuilder<C> {
    stacks: Arc<dyn StackStorage>,
    heaps: Arc<dyn HeapStorage>,
    codec: Arc<C>,
    resolver: Arc<TypeResolver>,
    descriptors: Arc<DescriptorRegistry>,
    surrogator: Option<Arc<ScopedSurrogator>>,
    cancellation: Option<Arc<dyn CancellationProvider>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    continuations: ContinuationFactory,
    key_prefix: String,
}

impl<C: DurableCodec> DurableHostBuilder<C> {
    /// Use `surrogator` as the root marshaling scope instead of an empty one.
    #[must_use]
    pub fn with_surrogator(mut self, surrogator: Arc<ScopedSurrogator>) -> Self {
        self.surrogator = Some(surrogator);
        self
    }

    /// Defaults to an [`InProcessCancellationProvider`].
    #[must_use]
    pub fn with_cancellation_provider(mut self, provider: Arc<dyn CancellationProvider>) -> Self {
        self.cancellation = Some(provider);
        self
    }

    /// Defaults to a [`ManualScheduler`].
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    #[must_use]
    pub fn with_continuations(mut self, continuations: ContinuationFactory) -> Self {
        self.continuations = continuations;
        self
    }

    /// Namespace every heap storage key with `prefix`.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn build(self) -> DurableHost<C> {
        let surrogator = self
            .surrogator
            .unwrap_or_else(|| ScopedSurrogator::root(Arc::clone(&self.resolver)));
        DurableHost {
            stacks: self.stacks,
            heaps: self.heaps,
            codec: self.codec,
            resolver: self.resolver,
            descriptors: self.descriptors,
            surrogator,
            cancellation: self
                .cancellation
                .unwrap_or_else(|| Arc::new(InProcessCancellationProvider::new())),
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(ManualScheduler::new())),
            continuations: self.continuations,
            key_prefix: self.key_prefix,
        }
    }
}
