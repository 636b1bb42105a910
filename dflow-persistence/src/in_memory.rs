//! In-memory storage.
//!
//! Stores everything in HashMaps behind `RwLock`s. Useful for testing and as
//! a reference implementation.

use crate::backend::{BackendError, BlobStorage, FrameStack, HeapStorage, StackStorage};
use async_trait::async_trait;
use bytes::Bytes;
use dflow_core::FlowId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory backend implementing every storage contract.
///
/// Clones share the same maps, so one instance can be handed to several
/// hosts standing in for separate processes.
///
/// # Example
///
/// ```rust,ignore
/// let backend = InMemoryBackend::new();
/// backend.save("heap/abc", Bytes::from_static(b"{}")).await?;
/// assert!(backend.load("heap/abc").await?.is_some());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    stacks: Arc<RwLock<HashMap<FlowId, FrameStack>>>,
    values: Arc<RwLock<HashMap<String, Bytes>>>,
    blobs: Arc<RwLock<HashMap<FlowId, Bytes>>>,
}

fn lock_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::Backend(format!("Lock error: {}", e))
}

impl InMemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored stacks.
    pub fn stack_count(&self) -> usize {
        self.stacks.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Keys currently held in key/value storage.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .read()
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Whether nothing at all is stored.
    pub fn is_empty(&self) -> bool {
        self.stack_count() == 0
            && self.keys().is_empty()
            && self.blobs.read().map(|b| b.is_empty()).unwrap_or(true)
    }
}

#[async_trait]
impl StackStorage for InMemoryBackend {
    async fn load_stack(&self, id: FlowId) -> Result<FrameStack, BackendError> {
        let stacks = self.stacks.read().map_err(lock_error)?;
        Ok(stacks.get(&id).cloned().unwrap_or_default())
    }

    async fn save_stack(&self, id: FlowId, stack: &FrameStack) -> Result<(), BackendError> {
        let mut stacks = self.stacks.write().map_err(lock_error)?;
        stacks.insert(id, stack.clone());
        Ok(())
    }

    async fn delete_stack(&self, id: FlowId) -> Result<(), BackendError> {
        let mut stacks = self.stacks.write().map_err(lock_error)?;
        stacks.remove(&id);
        Ok(())
    }

    async fn push_frame(&self, id: FlowId, frame: Bytes) -> Result<(), BackendError> {
        let mut stacks = self.stacks.write().map_err(lock_error)?;
        stacks.entry(id).or_default().push(frame);
        Ok(())
    }

    async fn pop_frame(&self, id: FlowId) -> Result<Option<Bytes>, BackendError> {
        let mut stacks = self.stacks.write().map_err(lock_error)?;
        let Some(stack) = stacks.get_mut(&id) else {
            return Ok(None);
        };
        let frame = stack.pop();
        if stack.is_empty() {
            stacks.remove(&id);
        }
        Ok(frame)
    }
}

#[async_trait]
impl HeapStorage for InMemoryBackend {
    async fn save(&self, key: &str, value: Bytes) -> Result<(), BackendError> {
        let mut values = self.values.write().map_err(lock_error)?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let values = self.values.read().map_err(lock_error)?;
        Ok(values.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut values = self.values.write().map_err(lock_error)?;
        values.remove(key);
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for InMemoryBackend {
    async fn load_blob(&self, id: FlowId) -> Result<Option<Bytes>, BackendError> {
        let blobs = self.blobs.read().map_err(lock_error)?;
        Ok(blobs.get(&id).cloned())
    }

    async fn save_blob(&self, id: FlowId, blob: Bytes) -> Result<(), BackendError> {
        let mut blobs = self.blobs.write().map_err(lock_error)?;
        blobs.insert(id, blob);
        Ok(())
    }

    async fn delete_blob(&self, id: FlowId) -> Result<(), BackendError> {
        let mut blobs = self.blobs.write().map_err(lock_error)?;
        blobs.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stack_save_load_delete() {
        let backend = InMemoryBackend::new();
        let id = FlowId::new_flow();

        assert!(backend.load_stack(id).await.unwrap().is_empty());

        let mut stack = FrameStack::new();
        stack.push(Bytes::from_static(b"a"));
        stack.push(Bytes::from_static(b"b"));
        backend.save_stack(id, &stack).await.unwrap();

        let mut loaded = backend.load_stack(id).await.unwrap();
        assert_eq!(loaded.pop(), Some(Bytes::from_static(b"b")));
        assert_eq!(backend.stack_count(), 1);

        backend.delete_stack(id).await.unwrap();
        backend.delete_stack(id).await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_frames_push_and_pop_individually() {
        let backend = InMemoryBackend::new();
        let id = FlowId::new_flow();

        assert_eq!(backend.pop_frame(id).await.unwrap(), None);
        backend.push_frame(id, Bytes::from_static(b"a")).await.unwrap();
        backend.push_frame(id, Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(backend.load_stack(id).await.unwrap().len(), 2);

        assert_eq!(
            backend.pop_frame(id).await.unwrap(),
            Some(Bytes::from_static(b"b"))
        );
        assert_eq!(
            backend.pop_frame(id).await.unwrap(),
            Some(Bytes::from_static(b"a"))
        );
        assert_eq!(backend.pop_frame(id).await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_values_save_load_delete() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.load("missing").await.unwrap(), None);

        backend.save("k", Bytes::from_static(b"v")).await.unwrap();
        backend.save("k", Bytes::from_static(b"w")).await.unwrap();
        assert_eq!(
            backend.load("k").await.unwrap(),
            Some(Bytes::from_static(b"w"))
        );
        assert_eq!(backend.keys(), vec!["k".to_string()]);

        backend.delete("k").await.unwrap();
        backend.delete("k").await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let backend = InMemoryBackend::new();
        let other = backend.clone();
        let id = FlowId::new_operation();
        backend
            .save_blob(id, Bytes::from_static(b"blob"))
            .await
            .unwrap();
        assert_eq!(
            other.load_blob(id).await.unwrap(),
            Some(Bytes::from_static(b"blob"))
        );
    }
}
