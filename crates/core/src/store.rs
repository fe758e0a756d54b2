//! Durable call-record store.
//!
//! The orchestrator flushes the whole call map after every mutation, so the
//! boundary is a blob save/load/clear rather than per-record operations.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::call::Call;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access call store: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode call records: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait CallStore: Send + Sync {
    async fn save(&self, calls: &HashMap<String, Call>) -> Result<(), StoreError>;
    async fn load(&self) -> Result<HashMap<String, Call>, StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Call records as one pretty-printed JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CallStore for JsonFileStore {
    async fn save(&self, calls: &HashMap<String, Call>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(calls)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    async fn load(&self) -> Result<HashMap<String, Call>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(calls) => Ok(calls),
                Err(e) => {
                    // A corrupt store should not brick the application;
                    // start fresh and let the next save overwrite it.
                    tracing::warn!(
                        path = %self.path.display(),
                        "call store is corrupt ({e}); starting with no records"
                    );
                    Ok(HashMap::new())
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
