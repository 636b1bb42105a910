//! Durable cancellation.
//!
//! A flow that suspends leaves memory, so an in-process cancellation token
//! can't follow it. Instead each running flow registers a
//! [`CancellationHandler`] with a [`CancellationProvider`] under a
//! [`CancellationId`] derived from its flow id. Requests that arrive while no
//! handler is registered are dropped; the provider does not queue them.

use crate::error::FlowError;
use crate::id::FlowId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Identifier of a cancellable scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CancellationId(FlowId);

impl CancellationId {
    /// A fresh id not tied to any flow.
    pub fn new() -> Self {
        Self(FlowId::new_operation())
    }

    /// The id under which a running flow listens for cancellation.
    pub fn for_flow(id: FlowId) -> Self {
        Self(id)
    }

    pub fn flow_id(&self) -> FlowId {
        self.0
    }
}

impl Default for CancellationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CancellationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Something that can receive a cancellation request.
pub trait CancellationHandler: Send + Sync {
    fn handles(&self, id: CancellationId) -> bool;

    fn cancel(&self, id: CancellationId);
}

/// A one-shot cancellation latch.
#[derive(Debug)]
pub struct CancellationSource {
    id: CancellationId,
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSource {
    pub fn new(id: CancellationId) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn id(&self) -> CancellationId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Trip the latch. Returns `true` only for the call that tripped it.
    pub fn trip(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Wait until the latch is tripped.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl CancellationHandler for CancellationSource {
    fn handles(&self, id: CancellationId) -> bool {
        self.id == id
    }

    fn cancel(&self, id: CancellationId) {
        if self.handles(id) && self.trip() {
            tracing::debug!(cancellation_id = %id, "Cancellation observed");
        }
    }
}

/// Routes cancellation requests to registered handlers.
#[async_trait]
pub trait CancellationProvider: Send + Sync {
    fn register_handler(&self, handler: Arc<dyn CancellationHandler>);

    fn unregister_handler(&self, handler: &Arc<dyn CancellationHandler>);

    /// Deliver a cancellation now.
    async fn cancel(&self, id: CancellationId) -> Result<(), FlowError>;

    /// Deliver a cancellation at `expiration`. A time in the past delivers
    /// as soon as possible.
    async fn cancel_at(&self, id: CancellationId, expiration: DateTime<Utc>) -> Result<(), FlowError>;
}

struct Scheduled {
    expiration: DateTime<Utc>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    handlers: RwLock<Vec<Arc<dyn CancellationHandler>>>,
    scheduled: Mutex<HashMap<CancellationId, Scheduled>>,
}

impl Registry {
    fn deliver(&self, id: CancellationId) -> usize {
        let targets: Vec<Arc<dyn CancellationHandler>> = match self.handlers.read() {
            Ok(handlers) => handlers.iter().filter(|h| h.handles(id)).cloned().collect(),
            Err(e) => {
                tracing::warn!(cancellation_id = %id, error = %e, "Handler registry poisoned");
                return 0;
            }
        };
        if targets.is_empty() {
            tracing::debug!(cancellation_id = %id, "No handler registered, dropping cancellation");
        }
        for handler in &targets {
            handler.cancel(id);
        }
        targets.len()
    }

    fn take_scheduled(&self, id: CancellationId) -> Option<Scheduled> {
        self.scheduled.lock().ok().and_then(|mut s| s.remove(&id))
    }
}

/// [`CancellationProvider`] for a single process.
///
/// Scheduled cancellations run as tokio tasks. One id holds at most one
/// pending schedule: the earliest expiration wins, and an immediate request
/// aborts the schedule so a scope is cancelled at most once.
#[derive(Clone, Default)]
pub struct InProcessCancellationProvider {
    registry: Arc<Registry>,
}

impl InProcessCancellationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_count(&self) -> usize {
        self.registry.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_scheduled(&self, id: CancellationId) -> bool {
        self.registry
            .scheduled
            .lock()
            .map(|s| s.contains_key(&id))
            .unwrap_or(false)
    }
}

fn same_handler(a: &Arc<dyn CancellationHandler>, b: &Arc<dyn CancellationHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[async_trait]
impl CancellationProvider for InProcessCancellationProvider {
    fn register_handler(&self, handler: Arc<dyn CancellationHandler>) {
        if let Ok(mut handlers) = self.registry.handlers.write()
            && !handlers.iter().any(|h| same_handler(h, &handler))
        {
            handlers.push(handler);
        }
    }

    fn unregister_handler(&self, handler: &Arc<dyn CancellationHandler>) {
        if let Ok(mut handlers) = self.registry.handlers.write() {
            handlers.retain(|h| !same_handler(h, handler));
        }
    }

    async fn cancel(&self, id: CancellationId) -> Result<(), FlowError> {
        if let Some(scheduled) = self.registry.take_scheduled(id) {
            scheduled.task.abort();
        }
        self.registry.deliver(id);
        Ok(())
    }

    async fn cancel_at(&self, id: CancellationId, expiration: DateTime<Utc>) -> Result<(), FlowError> {
        let mut scheduled = self
            .registry
            .scheduled
            .lock()
            .map_err(|e| FlowError::Protocol(format!("Lock error: {}", e)))?;

        if let Some(existing) = scheduled.get(&id)
            && existing.expiration <= expiration
        {
            tracing::debug!(cancellation_id = %id, "Earlier cancellation already scheduled");
            return Ok(());
        }

        let delay = (expiration - Utc::now()).to_std().unwrap_or_default();
        let registry = Arc::clone(&self.registry);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut scheduled) = registry.scheduled.lock() {
                scheduled.remove(&id);
            }
            registry.deliver(id);
        });

        if let Some(previous) = scheduled.insert(id, Scheduled { expiration, task }) {
            previous.task.abort();
        }
        tracing::debug!(cancellation_id = %id, %expiration, "Cancellation scheduled");
        Ok(())
    }
}
