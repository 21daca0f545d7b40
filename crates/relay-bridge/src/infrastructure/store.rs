//! TOML file persistence for the job queue.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::application::store::{QueueStore, StoreError, StoredQueue};

/// Keeps the queue in a TOML file; writes go to a temporary file first and
/// are renamed into place.
#[derive(Debug, Clone)]
pub struct TomlQueueStore {
    path: PathBuf,
}

impl TomlQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueStore for TomlQueueStore {
    fn load(&self) -> Result<Option<StoredQueue>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Parse(e.to_string()))
    }

    fn save(&self, queue: &StoredQueue) -> Result<(), StoreError> {
        let text = toml::to_string(queue).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&tmp, text).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), jobs = queue.jobs.len(), "job queue saved");
        Ok(())
    }
}
