//! State store implementations
//!
//! All writes to a given run's checkpoint are serialized per run id
//! (single-writer-per-run); reads are snapshots. Saves carrying a version
//! at or below the stored one are rejected as stale.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{Result, RunId, StrataError};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointFilter};

/// Durable key-value store of workflow checkpoints.
///
/// `save` is atomic save-or-fail: a checkpoint is either fully durable or
/// not written at all.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn load(&self, run_id: &str) -> Result<Checkpoint>;
    async fn list(&self, filter: &CheckpointFilter) -> Result<Vec<Checkpoint>>;
}

/// In-memory store; reads are lock-free snapshots (clone-out under a
/// read lock, no writer blocking on readers).
#[derive(Default)]
pub struct MemoryStateStore {
    checkpoints: RwLock<HashMap<RunId, Checkpoint>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut map = self.checkpoints.write().await;

        if let Some(existing) = map.get(checkpoint.run_id()) {
            if checkpoint.version() <= existing.version() {
                return Err(StrataError::Store(format!(
                    "stale checkpoint for {}: version {} <= stored {}",
                    checkpoint.run_id(),
                    checkpoint.version(),
                    existing.version()
                )));
            }
        }

        map.insert(checkpoint.run_id().to_string(), checkpoint.clone());
        debug!(run_id = checkpoint.run_id(), version = checkpoint.version(), "Saved checkpoint");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Checkpoint> {
        self.checkpoints
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StrataError::RunNotFound(run_id.to_string()))
    }

    async fn list(&self, filter: &CheckpointFilter) -> Result<Vec<Checkpoint>> {
        let map = self.checkpoints.read().await;
        let mut results: Vec<Checkpoint> =
            map.values().filter(|c| filter.matches(c)).cloned().collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }
}

/// File-backed store: one `{run_id}.json` per run under a state directory.
///
/// Atomicity comes from writing a temp file and renaming it into place;
/// a per-run mutex map enforces the single-writer-per-run policy.
pub struct JsonFileStore {
    dir: PathBuf,
    write_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    async fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(run_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrataError::Store(format!(
                "failed to read checkpoint {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let run_lock = self.lock_for(checkpoint.run_id()).await;
        let _guard = run_lock.lock().await;

        if let Some(existing) = self.read_checkpoint(checkpoint.run_id()).await? {
            if checkpoint.version() <= existing.version() {
                return Err(StrataError::Store(format!(
                    "stale checkpoint for {}: version {} <= stored {}",
                    checkpoint.run_id(),
                    checkpoint.version(),
                    existing.version()
                )));
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StrataError::Store(format!("failed to create state dir: {}", e)))?;

        let json = serde_json::to_string_pretty(checkpoint)?;
        let path = self.path_for(checkpoint.run_id());
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.run_id()));

        // Temp write + rename keeps the save atomic: readers only ever see
        // the previous complete checkpoint or the new one.
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StrataError::Store(format!("failed to write checkpoint: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StrataError::Store(format!("failed to commit checkpoint: {}", e)))?;

        debug!(
            run_id = checkpoint.run_id(),
            version = checkpoint.version(),
            path = %path.display(),
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Checkpoint> {
        self.read_checkpoint(run_id)
            .await?
            .ok_or_else(|| StrataError::RunNotFound(run_id.to_string()))
    }

    async fn list(&self, filter: &CheckpointFilter) -> Result<Vec<Checkpoint>> {
        let mut results = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => {
                return Err(StrataError::Store(format!(
                    "failed to read state dir: {}",
                    e
                )))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StrataError::Store(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StrataError::Store(e.to_string()))?;
            let checkpoint: Checkpoint = serde_json::from_str(&content)?;
            if filter.matches(&checkpoint) {
                results.push(checkpoint);
            }
        }

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }
}
