//! Durable checkpoint records - the commit log of a run.
//!
//! A checkpoint is written only after the stage's artifact is durably
//! stored; it is the record that makes a stage "committed". Writes are
//! atomic (temp file + rename), so a crash mid-write leaves the previous
//! valid checkpoint intact and resume re-executes exactly the stage whose
//! checkpoint never landed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::store::{atomic_write_json, read_json};

/// Summary statistics for one committed stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageStats {
    pub duration_ms: u64,
    /// Short output digest; bounded by the journal, stored verbatim here.
    pub summary: String,
    /// The attempt that succeeded (1-based).
    pub attempt: u32,
    pub completed_at: DateTime<Utc>,
}

impl StageStats {
    pub fn new(duration_ms: u64, summary: &str, attempt: u32) -> Self {
        Self {
            duration_ms,
            summary: summary.to_string(),
            attempt,
            completed_at: Utc::now(),
        }
    }
}

/// Durable record of which stages have committed, in order.
///
/// `completed_stages` is order-preserving and duplicate-free; it only ever
/// grows. A retried stage updates its stats entry without appending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub completed_stages: Vec<String>,
    pub stats: BTreeMap<String, StageStats>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            completed_stages: Vec::new(),
            stats: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }
}

/// Checkpoint persistence, one `checkpoint.json` per run directory.
pub struct CheckpointStore {
    runs_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self { runs_dir }
    }

    fn path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir
            .join(run_id.to_string())
            .join("checkpoint.json")
    }

    /// Record that `stage` committed, atomically replacing the prior
    /// checkpoint. Re-saving an already-committed stage updates its stats
    /// without duplicating the entry.
    pub fn save_stage(
        &self,
        run_id: Uuid,
        stage: &str,
        stats: StageStats,
    ) -> Result<Checkpoint, StoreError> {
        let mut checkpoint = self.load(run_id)?.unwrap_or_else(|| Checkpoint::new(run_id));

        if !checkpoint.is_completed(stage) {
            checkpoint.completed_stages.push(stage.to_string());
        }
        checkpoint.stats.insert(stage.to_string(), stats);
        checkpoint.updated_at = Utc::now();

        atomic_write_json(&self.path(run_id), "checkpoint", &checkpoint)?;
        Ok(checkpoint)
    }

    /// Load the checkpoint, or `None` if no stage has committed yet.
    ///
    /// A checkpoint that exists but does not parse is corruption, never
    /// silently treated as absent: the run is blocked until an operator
    /// discards it.
    pub fn load(&self, run_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.path(run_id);
        match read_json::<Checkpoint>(&path)? {
            None => Ok(None),
            Some(Err(e)) => Err(StoreError::CheckpointCorrupted {
                run_id: run_id.to_string(),
                path,
                message: e.to_string(),
            }),
            Some(Ok(checkpoint)) => Ok(Some(checkpoint)),
        }
    }

    /// First stage in `stage_order` not yet committed, or `None` when every
    /// stage is committed (the run is complete).
    pub fn get_resume_stage(
        &self,
        run_id: Uuid,
        stage_order: &[String],
    ) -> Result<Option<String>, StoreError> {
        let checkpoint = self.load(run_id)?;
        let resume = match checkpoint {
            None => stage_order.first().cloned(),
            Some(cp) => stage_order
                .iter()
                .find(|stage| !cp.is_completed(stage))
                .cloned(),
        };
        Ok(resume)
    }

    /// Operator action: discard a (typically corrupted) checkpoint so the
    /// run can restart from its first stage. Returns whether a checkpoint
    /// existed.
    pub fn discard(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let path = self.path(run_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|source| StoreError::Unavailable { path, source })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Vec<String> {
        vec![
            "research".into(),
            "plan".into(),
            "write-tests".into(),
            "implement".into(),
            "review".into(),
        ]
    }

    fn store() -> (CheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (CheckpointStore::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn load_before_any_save_is_none() {
        let (store, _dir) = store();
        assert!(store.load(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn save_stage_appends_in_order() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        store
            .save_stage(run_id, "research", StageStats::new(100, "notes", 1))
            .unwrap();
        let cp = store
            .save_stage(run_id, "plan", StageStats::new(200, "plan", 1))
            .unwrap();
        assert_eq!(cp.completed_stages, vec!["research", "plan"]);
        assert_eq!(cp.stats["plan"].duration_ms, 200);
    }

    #[test]
    fn resaving_a_stage_never_duplicates() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        store
            .save_stage(run_id, "research", StageStats::new(100, "first", 1))
            .unwrap();
        let cp = store
            .save_stage(run_id, "research", StageStats::new(150, "second", 2))
            .unwrap();
        assert_eq!(cp.completed_stages, vec!["research"]);
        assert_eq!(cp.stats["research"].summary, "second");
        assert_eq!(cp.stats["research"].attempt, 2);
    }

    #[test]
    fn resume_stage_skips_committed_prefix() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        store
            .save_stage(run_id, "research", StageStats::new(1, "a", 1))
            .unwrap();
        store
            .save_stage(run_id, "plan", StageStats::new(1, "b", 1))
            .unwrap();
        let resume = store.get_resume_stage(run_id, &order()).unwrap();
        assert_eq!(resume.as_deref(), Some("write-tests"));
    }

    #[test]
    fn resume_stage_with_no_checkpoint_is_first_stage() {
        let (store, _dir) = store();
        let resume = store.get_resume_stage(Uuid::new_v4(), &order()).unwrap();
        assert_eq!(resume.as_deref(), Some("research"));
    }

    #[test]
    fn resume_stage_when_all_committed_is_none() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        for stage in order() {
            store
                .save_stage(run_id, &stage, StageStats::new(1, "done", 1))
                .unwrap();
        }
        assert!(store.get_resume_stage(run_id, &order()).unwrap().is_none());
    }

    #[test]
    fn checkpoint_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        {
            let store = CheckpointStore::new(dir.path().to_path_buf());
            store
                .save_stage(run_id, "research", StageStats::new(5, "notes", 1))
                .unwrap();
        }
        {
            let store = CheckpointStore::new(dir.path().to_path_buf());
            let cp = store.load(run_id).unwrap().unwrap();
            assert_eq!(cp.completed_stages, vec!["research"]);
        }
    }

    #[test]
    fn corrupted_checkpoint_is_reported_not_masked() {
        let (store, dir) = store();
        let run_id = Uuid::new_v4();
        let run_dir = dir.path().join(run_id.to_string());
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("checkpoint.json"), "{truncated").unwrap();

        let err = store.load(run_id).unwrap_err();
        assert!(matches!(err, StoreError::CheckpointCorrupted { .. }));
        // get_resume_stage must not treat corruption as a fresh run.
        assert!(store.get_resume_stage(run_id, &order()).is_err());
    }

    #[test]
    fn discard_clears_corruption() {
        let (store, dir) = store();
        let run_id = Uuid::new_v4();
        let run_dir = dir.path().join(run_id.to_string());
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("checkpoint.json"), "garbage").unwrap();

        assert!(store.discard(run_id).unwrap());
        assert!(store.load(run_id).unwrap().is_none());
        // Discarding again is a no-op.
        assert!(!store.discard(run_id).unwrap());
    }

    #[test]
    fn completed_list_never_decreases() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let mut prev_len = 0;
        for stage in ["research", "plan", "plan", "write-tests"] {
            let cp = store
                .save_stage(run_id, stage, StageStats::new(1, "s", 1))
                .unwrap();
            assert!(cp.completed_stages.len() >= prev_len);
            prev_len = cp.completed_stages.len();
        }
        assert_eq!(prev_len, 3);
    }
}
