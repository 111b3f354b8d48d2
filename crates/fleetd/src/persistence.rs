//! Durable storage for the metrics history.
//!
//! The metrics bus serializes its per-agent series to bytes and hands them
//! to a [`HistoryBackend`] under a key. [`FileHistoryBackend`] writes one
//! JSON file per key; [`MemoryHistoryBackend`] keeps bytes in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Errors loading or saving history.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("history I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid history key: {0:?}")]
    InvalidKey(String),
}

/// Key/value store for serialized history.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Returns the bytes saved under `key`, or `None` if nothing was saved.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), PersistenceError>;
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileHistoryBackend {
    dir: PathBuf,
}

impl FileHistoryBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl HistoryBackend for FileHistoryBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No saved history");
                Ok(None)
            }
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        // Readers only ever see a complete file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_error(&path))?;

        debug!(path = %path.display(), bytes = bytes.len(), "History saved");
        Ok(())
    }
}

/// Keeps saved history in memory.
#[derive(Debug, Default)]
pub struct MemoryHistoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryHistoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryBackend for MemoryHistoryBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), PersistenceError> {
        self.entries.lock().insert(key.to_string(), bytes);
        Ok(())
    }
}
