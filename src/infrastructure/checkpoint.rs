//! Crash-safe study checkpoints
//!
//! One JSON snapshot per study under the checkpoint directory. Writes follow
//! the write-temp-then-rename discipline with fsync of both file and
//! directory, so readers observe either the pre-image or the post-image,
//! never a torn write. The in-memory checkpoint is authoritative: a failed
//! save is surfaced and logged but never corrupts run state.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::error::ErrorCode;
use crate::domain::job::{CellKey, RetryState};
use crate::domain::manifest::CheckpointConfig;
use crate::utils::SharedClock;

/// Current on-disk format version. Readers refuse anything newer.
pub const CHECKPOINT_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("checkpoint version {found} is newer than supported {supported}")]
    VersionMismatch { found: u32, supported: u32 },
    #[error("checkpoint for study {0} is corrupt: {1}")]
    Corrupt(String, String),
}

/// Terminal outcome of one cell, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellResult {
    pub cell_key: CellKey,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Study identity and shape captured when the checkpoint was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub surfaces: Vec<String>,
    pub locations: Vec<String>,
    pub query_count: usize,
    #[serde(default)]
    pub legal_hold: bool,
}

/// Durable snapshot of a study's progress and retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub study_id: String,
    pub study_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic per-study save counter.
    #[serde(default)]
    pub sequence_number: u64,
    pub total_cells: u64,
    pub completed_cells: u64,
    pub failed_cells: u64,
    pub progress_percent: u32,
    /// Original dispatch order of every cell in the study.
    pub execution_queue: Vec<CellKey>,
    pub cell_results: HashMap<CellKey, CellResult>,
    pub retry_states: HashMap<CellKey, RetryState>,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    pub fn new(
        study_id: impl Into<String>,
        study_name: impl Into<String>,
        execution_queue: Vec<CellKey>,
        metadata: CheckpointMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        let total_cells = execution_queue.len() as u64;
        Self {
            version: CHECKPOINT_VERSION,
            study_id: study_id.into(),
            study_name: study_name.into(),
            created_at: now,
            updated_at: now,
            sequence_number: 0,
            total_cells,
            completed_cells: 0,
            failed_cells: 0,
            progress_percent: if total_cells == 0 { 100 } else { 0 },
            execution_queue,
            cell_results: HashMap::new(),
            retry_states: HashMap::new(),
            metadata,
        }
    }

    fn recompute_progress(&mut self) {
        self.progress_percent = if self.total_cells == 0 {
            100
        } else {
            let done = (self.completed_cells + self.failed_cells) as f64;
            ((done / self.total_cells as f64) * 100.0).round() as u32
        };
    }
}

/// Record a terminal cell outcome. Pure: returns the updated snapshot.
/// Counters are recounted from the map, so re-recording a cell never
/// double-counts.
pub fn apply_result(mut ckpt: Checkpoint, result: CellResult) -> Checkpoint {
    let completed_at = result.completed_at;
    ckpt.cell_results.insert(result.cell_key.clone(), result);
    ckpt.completed_cells = ckpt.cell_results.values().filter(|r| r.success).count() as u64;
    ckpt.failed_cells = ckpt.cell_results.values().filter(|r| !r.success).count() as u64;
    ckpt.updated_at = completed_at.max(ckpt.updated_at);
    ckpt.recompute_progress();
    ckpt
}

/// Record retry bookkeeping for a cell. Pure.
pub fn apply_retry(
    mut ckpt: Checkpoint,
    cell_key: CellKey,
    state: RetryState,
    now: DateTime<Utc>,
) -> Checkpoint {
    ckpt.retry_states.insert(cell_key, state);
    ckpt.updated_at = now;
    ckpt
}

/// Cells still owed work: queue entries without a terminal result.
pub fn remaining_cells(ckpt: &Checkpoint) -> Vec<CellKey> {
    ckpt.execution_queue
        .iter()
        .filter(|key| !ckpt.cell_results.contains_key(*key))
        .cloned()
        .collect()
}

/// Resume feasibility report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeCheck {
    pub can_resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub remaining_cells: usize,
}

pub fn can_resume(ckpt: &Checkpoint) -> ResumeCheck {
    let remaining = remaining_cells(ckpt).len();
    if ckpt.completed_cells == ckpt.total_cells {
        ResumeCheck {
            can_resume: false,
            reason: Some("study already completed every cell".to_string()),
            remaining_cells: 0,
        }
    } else if ckpt.completed_cells + ckpt.failed_cells >= ckpt.total_cells || remaining == 0 {
        // A mix of completed and failed can settle every cell too; there is
        // nothing left to dispatch, so resuming would spin forever.
        ResumeCheck {
            can_resume: false,
            reason: Some("every cell already reached a terminal state".to_string()),
            remaining_cells: remaining,
        }
    } else {
        ResumeCheck {
            can_resume: true,
            reason: None,
            remaining_cells: remaining,
        }
    }
}

/// Summary row for `CheckpointStore::list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub study_id: String,
    pub study_name: String,
    pub updated_at: DateTime<Utc>,
    pub progress_percent: u32,
    pub remaining_cells: usize,
    pub legal_hold: bool,
}

/// File-backed checkpoint store, one `{study_id}.json` per study.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, study_id: &str) -> PathBuf {
        self.dir.join(format!("{study_id}.json"))
    }

    /// Atomically persist a full snapshot.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.study_id);
        let dir = self.dir.clone();
        let payload = serde_json::to_vec_pretty(checkpoint)?;

        tokio::task::spawn_blocking(move || -> Result<(), CheckpointError> {
            std::fs::create_dir_all(&dir)?;

            let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
            {
                let mut file = std::fs::File::create(&tmp)?;
                file.write_all(&payload)?;
                file.sync_all()?;
            }
            if let Err(e) = std::fs::rename(&tmp, &path) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
            // Make the rename itself durable.
            if let Ok(dir_handle) = std::fs::File::open(&dir) {
                let _ = dir_handle.sync_all();
            }
            Ok(())
        })
        .await
        .map_err(|join| CheckpointError::Io(std::io::Error::other(join)))??;

        debug!(
            study_id = %checkpoint.study_id,
            seq = checkpoint.sequence_number,
            progress = checkpoint.progress_percent,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load a snapshot, or `None` when no file exists. A file that exists but
    /// cannot be parsed is an error: resuming from it would not be safe.
    pub async fn load(&self, study_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(study_id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&content)
            .map_err(|e| CheckpointError::Corrupt(study_id.to_string(), e.to_string()))?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: checkpoint.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        Ok(Some(checkpoint))
    }

    pub async fn exists(&self, study_id: &str) -> bool {
        tokio::fs::try_exists(self.path_for(study_id))
            .await
            .unwrap_or(false)
    }

    /// Idempotent delete.
    pub async fn delete(&self, study_id: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(self.path_for(study_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate resumable studies with age and progress.
    pub async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let mut summaries = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(study_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(study_id).await {
                Ok(Some(ckpt)) => summaries.push(CheckpointSummary {
                    study_id: ckpt.study_id.clone(),
                    study_name: ckpt.study_name.clone(),
                    updated_at: ckpt.updated_at,
                    progress_percent: ckpt.progress_percent,
                    remaining_cells: remaining_cells(&ckpt).len(),
                    legal_hold: ckpt.metadata.legal_hold,
                }),
                Ok(None) => {}
                Err(e) => warn!(study_id, error = %e, "skipping unreadable checkpoint"),
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Delete snapshots older than the retention window. Legal-hold studies
    /// are never touched.
    pub async fn cleanup(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, CheckpointError> {
        let mut removed = 0;
        for summary in self.list().await? {
            if summary.legal_hold {
                continue;
            }
            if now - summary.updated_at > max_age {
                self.delete(&summary.study_id).await?;
                info!(study_id = %summary.study_id, "expired checkpoint removed");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Auto-save policy around a store: saves when enough cells accumulated since
/// the last save OR enough seconds elapsed, whichever comes first.
#[derive(Debug)]
pub struct CheckpointManager {
    store: CheckpointStore,
    config: CheckpointConfig,
    clock: SharedClock,
    state: Mutex<ManagerState>,
}

#[derive(Debug)]
struct ManagerState {
    checkpoint: Option<Checkpoint>,
    cells_since_save: u32,
    last_save_at: Option<DateTime<Utc>>,
}

impl CheckpointManager {
    pub fn new(store: CheckpointStore, config: CheckpointConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
            state: Mutex::new(ManagerState {
                checkpoint: None,
                cells_since_save: 0,
                last_save_at: None,
            }),
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Install a fresh in-memory checkpoint (new study or restored snapshot).
    pub async fn install(&self, checkpoint: Checkpoint) {
        let mut state = self.state.lock().await;
        state.checkpoint = Some(checkpoint);
        state.cells_since_save = 0;
        state.last_save_at = Some(self.clock.now());
    }

    pub async fn current(&self) -> Option<Checkpoint> {
        self.state.lock().await.checkpoint.clone()
    }

    /// Record a terminal cell outcome and save if the policy says so.
    /// Returns whether a save happened.
    pub async fn record_result(&self, result: CellResult) -> Result<bool, CheckpointError> {
        let mut state = self.state.lock().await;
        let Some(checkpoint) = state.checkpoint.take() else {
            return Ok(false);
        };
        state.checkpoint = Some(apply_result(checkpoint, result));
        state.cells_since_save += 1;
        self.maybe_save(&mut state).await
    }

    /// Record retry bookkeeping for a cell; never triggers a save by itself.
    pub async fn record_retry(&self, cell_key: CellKey, retry: RetryState) {
        let mut state = self.state.lock().await;
        if let Some(checkpoint) = state.checkpoint.take() {
            state.checkpoint = Some(apply_retry(checkpoint, cell_key, retry, self.clock.now()));
        }
    }

    async fn maybe_save(&self, state: &mut ManagerState) -> Result<bool, CheckpointError> {
        if !self.config.enabled {
            return Ok(false);
        }
        let due_by_cells = state.cells_since_save >= self.config.save_interval_cells;
        let due_by_time = state.last_save_at.is_none_or(|last| {
            (self.clock.now() - last).num_seconds() >= self.config.save_interval_seconds as i64
        });
        if !(due_by_cells || due_by_time) {
            return Ok(false);
        }
        self.save_locked(state).await.map(|()| true)
    }

    async fn save_locked(&self, state: &mut ManagerState) -> Result<(), CheckpointError> {
        let Some(checkpoint) = state.checkpoint.as_mut() else {
            return Ok(());
        };
        checkpoint.sequence_number += 1;
        checkpoint.updated_at = self.clock.now();
        let snapshot = checkpoint.clone();

        match self.store.save(&snapshot).await {
            Ok(()) => {
                state.cells_since_save = 0;
                state.last_save_at = Some(self.clock.now());
                Ok(())
            }
            Err(e) => {
                // In-memory state stays authoritative; the next trigger retries.
                warn!(study_id = %snapshot.study_id, error = %e, "checkpoint save failed");
                Err(e)
            }
        }
    }

    /// Save now regardless of policy.
    pub async fn force_save(&self) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state).await
    }

    /// Final save-or-delete per `preserve_checkpoint`, then drop in-memory state.
    pub async fn finalize(&self) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        let Some(checkpoint) = state.checkpoint.take() else {
            return Ok(());
        };
        if self.config.preserve_checkpoint {
            let mut snapshot = checkpoint;
            snapshot.sequence_number += 1;
            snapshot.updated_at = self.clock.now();
            self.store.save(&snapshot).await?;
        } else {
            self.store.delete(&checkpoint.study_id).await?;
        }
        state.cells_since_save = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{ManualClock, system_clock};

    fn sample_checkpoint() -> Checkpoint {
        let queue: Vec<CellKey> = (0..4).map(|q| CellKey::new(q, "openai-api", "us")).collect();
        Checkpoint::new(
            "study-1",
            "resume test",
            queue,
            CheckpointMetadata {
                surfaces: vec!["openai-api".to_string()],
                locations: vec!["us".to_string()],
                query_count: 4,
                legal_hold: false,
            },
            Utc::now(),
        )
    }

    fn cell_result(key: CellKey, success: bool) -> CellResult {
        CellResult {
            cell_key: key,
            success,
            completed_at: Utc::now(),
            duration_ms: Some(10),
            response_length: Some(42),
            error_code: None,
            error_message: None,
        }
    }

    #[test]
    fn apply_result_counts_and_percent() {
        let ckpt = sample_checkpoint();
        let ckpt = apply_result(ckpt, cell_result(CellKey::new(0, "openai-api", "us"), true));
        let ckpt = apply_result(ckpt, cell_result(CellKey::new(1, "openai-api", "us"), false));

        assert_eq!(ckpt.completed_cells, 1);
        assert_eq!(ckpt.failed_cells, 1);
        assert_eq!(ckpt.progress_percent, 50);
        assert!(ckpt.completed_cells + ckpt.failed_cells <= ckpt.total_cells);
    }

    #[test]
    fn reapplying_a_cell_does_not_double_count() {
        let key = CellKey::new(0, "openai-api", "us");
        let ckpt = sample_checkpoint();
        let ckpt = apply_result(ckpt, cell_result(key.clone(), false));
        let ckpt = apply_result(ckpt, cell_result(key, true));

        assert_eq!(ckpt.completed_cells, 1);
        assert_eq!(ckpt.failed_cells, 0);
    }

    #[test]
    fn remaining_cells_excludes_terminal() {
        let ckpt = sample_checkpoint();
        let ckpt = apply_result(ckpt, cell_result(CellKey::new(2, "openai-api", "us"), true));
        let remaining = remaining_cells(&ckpt);
        assert_eq!(remaining.len(), 3);
        assert!(!remaining.contains(&CellKey::new(2, "openai-api", "us")));
    }

    #[test]
    fn can_resume_refuses_completed_study() {
        let mut ckpt = sample_checkpoint();
        for q in 0..4 {
            ckpt = apply_result(ckpt, cell_result(CellKey::new(q, "openai-api", "us"), true));
        }
        let check = can_resume(&ckpt);
        assert!(!check.can_resume);
        assert_eq!(check.remaining_cells, 0);
    }

    #[test]
    fn can_resume_refuses_mixed_terminal_study() {
        // One completed, three failed: nothing pending, nothing to resume.
        let mut ckpt = sample_checkpoint();
        ckpt = apply_result(ckpt, cell_result(CellKey::new(0, "openai-api", "us"), true));
        for q in 1..4 {
            ckpt = apply_result(ckpt, cell_result(CellKey::new(q, "openai-api", "us"), false));
        }
        assert_eq!(ckpt.completed_cells, 1);
        assert_eq!(ckpt.failed_cells, 3);

        let check = can_resume(&ckpt);
        assert!(!check.can_resume);
        assert_eq!(check.remaining_cells, 0);

        // A partially settled mix still resumes.
        let mut partial = sample_checkpoint();
        partial = apply_result(partial, cell_result(CellKey::new(0, "openai-api", "us"), false));
        let check = can_resume(&partial);
        assert!(check.can_resume);
        assert_eq!(check.remaining_cells, 3);
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ckpt = apply_result(
            sample_checkpoint(),
            cell_result(CellKey::new(0, "openai-api", "us"), true),
        );

        store.save(&ckpt).await.unwrap();
        let loaded = store.load("study-1").await.unwrap().unwrap();

        assert_eq!(loaded.study_id, ckpt.study_id);
        assert_eq!(loaded.completed_cells, 1);
        assert_eq!(loaded.execution_queue, ckpt.execution_queue);
        assert_eq!(loaded.progress_percent, ckpt.progress_percent);
    }

    #[tokio::test]
    async fn load_missing_is_none_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(!store.exists("nope").await);
        store.delete("nope").await.unwrap();
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn newer_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut ckpt = sample_checkpoint();
        ckpt.version = CHECKPOINT_VERSION + 1;
        store.save(&ckpt).await.unwrap();

        let err = store.load("study-1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal_not_silent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        tokio::fs::write(dir.path().join("broken.json"), b"{not json")
            .await
            .unwrap();

        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(..)));
    }

    #[tokio::test]
    async fn readers_tolerate_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ckpt = sample_checkpoint();
        let mut value = serde_json::to_value(&ckpt).unwrap();
        value["some_future_field"] = serde_json::json!({"a": 1});
        tokio::fs::write(
            dir.path().join("study-1.json"),
            serde_json::to_vec(&value).unwrap(),
        )
        .await
        .unwrap();

        assert!(store.load("study-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn manager_saves_on_cell_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let config = CheckpointConfig {
            enabled: true,
            save_interval_cells: 2,
            save_interval_seconds: 3600,
            preserve_checkpoint: true,
        };
        let manager = CheckpointManager::new(store, config, system_clock());
        manager.install(sample_checkpoint()).await;

        let saved = manager
            .record_result(cell_result(CellKey::new(0, "openai-api", "us"), true))
            .await
            .unwrap();
        assert!(!saved);

        let saved = manager
            .record_result(cell_result(CellKey::new(1, "openai-api", "us"), true))
            .await
            .unwrap();
        assert!(saved);
        assert!(manager.store().exists("study-1").await);
    }

    #[tokio::test]
    async fn manager_saves_on_elapsed_time() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(Utc::now());
        let config = CheckpointConfig {
            enabled: true,
            save_interval_cells: 1000,
            save_interval_seconds: 60,
            preserve_checkpoint: true,
        };
        let manager = CheckpointManager::new(
            CheckpointStore::new(dir.path()),
            config,
            clock.clone(),
        );
        manager.install(sample_checkpoint()).await;

        let saved = manager
            .record_result(cell_result(CellKey::new(0, "openai-api", "us"), true))
            .await
            .unwrap();
        assert!(!saved);

        clock.advance_millis(61_000);
        let saved = manager
            .record_result(cell_result(CellKey::new(1, "openai-api", "us"), true))
            .await
            .unwrap();
        assert!(saved);
    }

    #[tokio::test]
    async fn finalize_deletes_unless_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let manager = CheckpointManager::new(
            store.clone(),
            CheckpointConfig {
                preserve_checkpoint: false,
                ..CheckpointConfig::default()
            },
            system_clock(),
        );
        manager.install(sample_checkpoint()).await;
        manager.force_save().await.unwrap();
        assert!(store.exists("study-1").await);

        manager.finalize().await.unwrap();
        assert!(!store.exists("study-1").await);
    }
}
