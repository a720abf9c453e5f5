//! Durable FIFO backends for the queue manager.
//!
//! A queue stores captured requests (header + body bytes) for a single
//! consumer: the manager's worker peeks the oldest message (receiving the
//! same message again until it commits) and commits to drop it. Two
//! backends are provided: a directory-per-queue persistent store and a
//! bounded in-memory store.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sp_domain::{CapturedRequest, Result};

mod dir;
mod memory;

pub use dir::DirQueue;
pub use memory::MemoryQueue;

/// Thread-safe FIFO designed for concurrent producers and one consumer.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a request; the body stream is drained into the store.
    async fn put(&self, request: CapturedRequest) -> Result<()>;

    /// Oldest message, blocking until one arrives or `cancel` fires.
    /// Repeated peeks return the same message until [`commit`](Queue::commit).
    async fn peek(&self, cancel: &CancellationToken) -> Result<CapturedRequest>;

    /// Drop the oldest message.
    async fn commit(&self) -> Result<()>;

    /// Pending message count.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every resource held by the backend (files, channels).
    async fn destroy(&self) -> Result<()>;
}
