//! Job-queue boundary.
//!
//! The scheduling collaborator only needs "enqueue with idempotency key"
//! and "process with bounded concurrency" semantics. Job identity is the
//! entity id, so duplicate enqueues collapse while a job is pending.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{RemoteSessionId, RunId, VariantId};

/// Queue error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("queue error: {0}")]
    Internal(String),
}

/// Background work items.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Job {
    /// Reconcile one remote-session mirror.
    SyncSession(RemoteSessionId),
    /// Reconcile one remote-run mirror.
    SyncRun(RunId),
    /// Run capability discovery for a variant.
    Discover(VariantId),
}

impl Job {
    /// Idempotency key: duplicate enqueues of the same key collapse.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::SyncSession(id) => format!("sync-session:{id}"),
            Self::SyncRun(id) => format!("sync-run:{id}"),
            Self::Discover(id) => format!("discover:{id}"),
        }
    }
}

/// Job-queue boundary (external collaborator).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job; a duplicate of a still-pending job is a no-op.
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Pull the next pending job. Returns `None` once the queue is closed
    /// and drained.
    async fn dequeue(&self) -> Option<Job>;
}

#[cfg(feature = "memory")]
pub use memory::MemoryQueue;

#[cfg(feature = "memory")]
mod memory {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::{Job, JobQueue, QueueError, async_trait};

    /// In-memory idempotent queue: dedupe set over an unbounded channel.
    pub struct MemoryQueue {
        pending: Mutex<HashSet<String>>,
        tx: mpsc::UnboundedSender<Job>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    }

    impl Default for MemoryQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryQueue {
        #[must_use]
        pub fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                pending: Mutex::new(HashSet::new()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
            }
        }

        /// Test visibility: pending idempotency keys.
        #[must_use]
        pub fn pending_keys(&self) -> Vec<String> {
            let mut keys: Vec<_> = self
                .pending
                .lock()
                .expect("pending lock")
                .iter()
                .cloned()
                .collect();
            keys.sort();
            keys
        }

        /// Drain everything currently pending (test helper).
        pub async fn drain(&self) -> Vec<Job> {
            let mut jobs = Vec::new();
            let mut rx = self.rx.lock().await;
            while let Ok(job) = rx.try_recv() {
                self.pending
                    .lock()
                    .expect("pending lock")
                    .remove(&job.idempotency_key());
                jobs.push(job);
            }
            jobs
        }
    }

    #[async_trait]
    impl JobQueue for MemoryQueue {
        async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
            {
                let mut pending = self
                    .pending
                    .lock()
                    .map_err(|e| QueueError::Internal(e.to_string()))?;
                if !pending.insert(job.idempotency_key()) {
                    tracing::debug!(key = %job.idempotency_key(), "duplicate enqueue collapsed");
                    return Ok(());
                }
            }
            self.tx.send(job).map_err(|_| QueueError::Closed)
        }

        async fn dequeue(&self) -> Option<Job> {
            let job = self.rx.lock().await.recv().await?;
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&job.idempotency_key());
            }
            Some(job)
        }
    }
}
