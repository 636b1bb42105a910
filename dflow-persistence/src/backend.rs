//! Storage contracts for suspended flows.
//!
//! A suspended flow is persisted as a stack of encoded frames plus one heap
//! blob of shared values. Storage never looks inside either: bytes in, bytes
//! out. Implementations exist for any store that can hold bytes under a key
//! (in-memory, Redis, a SQL table, object storage).

use async_trait::async_trait;
use bytes::Bytes;
use dflow_core::{FlowError, FlowId};

/// Error type for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<BackendError> for FlowError {
    fn from(e: BackendError) -> Self {
        FlowError::Storage(Box::new(e))
    }
}

/// An ordered stack of encoded frames. The last pushed frame is the top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStack {
    frames: Vec<Bytes>,
}

impl FrameStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stack from frames ordered bottom to top.
    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    pub fn push(&mut self, frame: Bytes) {
        self.frames.push(frame);
    }

    /// Pop the top frame, or `None` when the stack is empty.
    pub fn pop(&mut self) -> Option<Bytes> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames ordered bottom to top.
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }
}

/// Storage for frame stacks, keyed by flow id.
///
/// Frames are pushed and popped one at a time. The default
/// [`push_frame`](Self::push_frame) and [`pop_frame`](Self::pop_frame) go
/// through a whole-stack load and save; stores with native list operations
/// should override them.
///
/// # Example
///
/// ```rust,ignore
/// let storage = InMemoryBackend::new();
/// storage.push_frame(id, frame).await?;
/// while let Some(frame) = storage.pop_frame(id).await? {
///     // top to bottom
/// }
/// ```
#[async_trait]
pub trait StackStorage: Send + Sync {
    /// Load the stack of `id`. An unknown id yields an empty stack.
    async fn load_stack(&self, id: FlowId) -> Result<FrameStack, BackendError>;

    /// Store `stack` as the full stack of `id`, replacing any previous one.
    async fn save_stack(&self, id: FlowId, stack: &FrameStack) -> Result<(), BackendError>;

    /// Delete the stack of `id`. Deleting an unknown id is not an error.
    async fn delete_stack(&self, id: FlowId) -> Result<(), BackendError>;

    /// Push `frame` on top of the stack of `id`, creating it if needed.
    async fn push_frame(&self, id: FlowId, frame: Bytes) -> Result<(), BackendError> {
        let mut stack = self.load_stack(id).await?;
        stack.push(frame);
        self.save_stack(id, &stack).await
    }

    /// Remove and return the top frame of `id`. `None` means no frames are
    /// left; the emptied stack is deleted.
    async fn pop_frame(&self, id: FlowId) -> Result<Option<Bytes>, BackendError> {
        let mut stack = self.load_stack(id).await?;
        let Some(frame) = stack.pop() else {
            return Ok(None);
        };
        if stack.is_empty() {
            self.delete_stack(id).await?;
        } else {
            self.save_stack(id, &stack).await?;
        }
        Ok(Some(frame))
    }
}

/// Key/value storage for heap snapshots and engine records.
#[async_trait]
pub trait HeapStorage: Send + Sync {
    async fn save(&self, key: &str, value: Bytes) -> Result<(), BackendError>;

    /// Load the value under `key`, or `None` if it does not exist.
    async fn load(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    /// Delete the value under `key`. Deleting an unknown key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;
}

/// Storage that can only hold one blob per flow id.
///
/// Stores without native list support can still host frame stacks through
/// [`FlattenedStack`](crate::FlattenedStack).
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn load_blob(&self, id: FlowId) -> Result<Option<Bytes>, BackendError>;

    async fn save_blob(&self, id: FlowId, blob: Bytes) -> Result<(), BackendError>;

    async fn delete_blob(&self, id: FlowId) -> Result<(), BackendError>;
}
