//! Persistence seam for the job queue.
//!
//! The scheduler saves the whole queue after every mutation and loads it
//! once at startup.  [`MemoryQueueStore`] keeps it in memory; the
//! infrastructure layer provides a TOML file store.

use std::path::PathBuf;
use std::sync::Mutex;

use relay_core::QueuedJob;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for queue persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error accessing queue file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse queue file: {0}")]
    Parse(String),

    #[error("failed to serialize queue: {0}")]
    Serialize(String),
}

/// Persisted form of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredQueue {
    /// Id the next enqueued job will receive.
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub jobs: Vec<QueuedJob>,
}

/// Read/write interface of the queue persistence component.
pub trait QueueStore: Send + Sync {
    /// Returns the stored queue, `None` if nothing was stored yet.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the stored data cannot be read.
    fn load(&self) -> Result<Option<StoredQueue>, StoreError>;

    /// Replaces the stored queue.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the data cannot be written.
    fn save(&self, queue: &StoredQueue) -> Result<(), StoreError>;
}

/// Non-durable store.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Option<StoredQueue>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Option<StoredQueue>, StoreError> {
        Ok(self.inner.lock().map(|q| q.clone()).unwrap_or_default())
    }

    fn save(&self, queue: &StoredQueue) -> Result<(), StoreError> {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(queue.clone());
        }
        Ok(())
    }
}
