//! Frame stacks over single-blob storage.

use crate::backend::{BackendError, BlobStorage, FrameStack, StackStorage};
use async_trait::async_trait;
use bytes::Bytes;
use dflow_core::FlowId;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize)]
struct StackBlob {
    frames: Vec<ByteBuf>,
}

/// Adapts a [`BlobStorage`] into a [`StackStorage`] by writing the whole
/// stack as one blob.
pub struct FlattenedStack<B> {
    blobs: B,
}

impl<B: BlobStorage> FlattenedStack<B> {
    pub fn new(blobs: B) -> Self {
        Self { blobs }
    }

    pub fn inner(&self) -> &B {
        &self.blobs
    }
}

#[async_trait]
impl<B: BlobStorage> StackStorage for FlattenedStack<B> {
    async fn load_stack(&self, id: FlowId) -> Result<FrameStack, BackendError> {
        let Some(blob) = self.blobs.load_blob(id).await? else {
            return Ok(FrameStack::new());
        };
        let decoded: StackBlob = serde_json::from_slice(&blob)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        Ok(FrameStack::from_frames(
            decoded
                .frames
                .into_iter()
                .map(|f| Bytes::from(f.into_vec()))
                .collect(),
        ))
    }

    async fn save_stack(&self, id: FlowId, stack: &FrameStack) -> Result<(), BackendError> {
        let blob = StackBlob {
            frames: stack
                .frames()
                .iter()
                .map(|f| ByteBuf::from(f.to_vec()))
                .collect(),
        };
        let encoded =
            serde_json::to_vec(&blob).map_err(|e| BackendError::Serialization(e.to_string()))?;
        tracing::trace!(flow_id = %id, frames = stack.len(), "Saving flattened stack");
        self.blobs.save_blob(id, Bytes::from(encoded)).await
    }

    async fn delete_stack(&self, id: FlowId) -> Result<(), BackendError> {
        self.blobs.delete_blob(id).await
    }
}
