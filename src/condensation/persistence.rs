//! Write-through of agent state after condensation
//!
//! Persistence is best-effort: callers log failures and keep going with the
//! in-memory state.

use super::history::AgentState;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Persistence backend error: {0}")]
    Backend(String),
}

/// Durable store for agent state
#[async_trait]
pub trait StatePersistence: Send + Sync {
    async fn persist(&self, state: &AgentState) -> Result<(), PersistenceError>;
}

/// Discards everything
#[derive(Debug, Default, Clone)]
pub struct NoopPersistence;

#[async_trait]
impl StatePersistence for NoopPersistence {
    async fn persist(&self, _state: &AgentState) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// One JSON file per agent under a directory
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for an agent; ids are reduced to filename-safe characters
    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        let safe: String = agent_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Load a previously persisted state, `None` if there is none
    pub async fn load(&self, agent_id: &str) -> Result<Option<AgentState>, PersistenceError> {
        let path = self.path_for(agent_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StatePersistence for JsonFilePersistence {
    async fn persist(&self, state: &AgentState) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&state.agent_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;

        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Persisted state for {} to {}", state.agent_id, path.display());
        Ok(())
    }
}
