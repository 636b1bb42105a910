//! Persistence layer for suspended flows.
//!
//! This crate provides the storage contracts the engine writes through, and
//! in-memory implementations of them.
//!
//! # Architecture
//!
//! - **StackStorage**: ordered frame stacks keyed by flow id.
//! - **HeapStorage**: key/value blobs for heap snapshots and engine records.
//! - **BlobStorage**: one blob per flow id, for stores without list support.
//!   Wrap it in a **FlattenedStack** to get a `StackStorage`.
//! - **InMemoryBackend**: a reference implementation of all three.
//!
//! # Implementing Custom Backends
//!
//! ```rust,ignore
//! use dflow_persistence::{BackendError, FrameStack, StackStorage};
//! use async_trait::async_trait;
//!
//! pub struct RedisStacks {
//!     // your Redis client
//! }
//!
//! #[async_trait]
//! impl StackStorage for RedisStacks {
//!     async fn load_stack(&self, id: FlowId) -> Result<FrameStack, BackendError> {
//!         // LRANGE stack:{id} 0 -1
//!     }
//!     // ... implement the other methods
//! }
//! ```

mod backend;
mod flattened;
mod in_memory;

pub use backend::{BackendError, BlobStorage, FrameStack, HeapStorage, StackStorage};
pub use flattened::FlattenedStack;
pub use in_memory::InMemoryBackend;
