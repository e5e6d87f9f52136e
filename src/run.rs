//! Workflow run state and durable run records.
//!
//! `WorkflowRun` is owned exclusively by the coordinator and mutated only
//! through the transition methods below; stages never touch it. The legal
//! transitions are:
//!
//! ```text
//! Initialized --> Validating --> Aborted            (terminal)
//!                  |        \--> Running
//!                  |              |--> Completed    (terminal)
//!                  |              |--> Failed    --resume--> Running
//!                  \--> Cancelled <--/           --resume--> Running
//! ```
//!
//! Completed and Aborted are terminal. Failed and Cancelled re-enter
//! Running through an explicit resume, picking up at the first incomplete
//! stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::{StoreError, WorkflowError};
use crate::store::{atomic_write_json, read_json};

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Initialized,
    Validating,
    Aborted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal states never leave through any transition. Failed and
    /// Cancelled are deliberately not terminal: resume re-enters Running.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Initialized => "initialized",
            RunStatus::Validating => "validating",
            RunStatus::Aborted => "aborted",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One end-to-end execution instance for a single feature request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub request: String,
    pub status: RunStatus,
    /// Fixed, ordered stage names for this run. Never reordered.
    pub stages: Vec<String>,
    /// Index of the stage currently (or next) being executed.
    pub current_stage: usize,
    /// Running estimate of working-context size in characters, fed only by
    /// journal summaries.
    pub context_chars: usize,
    /// Terminal failure diagnostic (failing stage, attempts), set when the
    /// run enters Failed. Cleared on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(request: &str, stages: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request: request.to_string(),
            status: RunStatus::Initialized,
            stages,
            current_stage: 0,
            context_chars: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, to: RunStatus, allowed: &[RunStatus]) -> Result<(), WorkflowError> {
        if !allowed.contains(&self.status) {
            return Err(WorkflowError::InvalidTransition {
                run_id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Initialized → Validating: the alignment gate is about to run.
    pub fn begin_validation(&mut self) -> Result<(), WorkflowError> {
        self.transition(RunStatus::Validating, &[RunStatus::Initialized])
    }

    /// Validating → Aborted: the gate rejected the request. Terminal.
    pub fn abort(&mut self) -> Result<(), WorkflowError> {
        self.transition(RunStatus::Aborted, &[RunStatus::Validating])
    }

    /// Enter (or re-enter) Running. Valid from Validating on a fresh run,
    /// or from Failed/Cancelled through resume.
    pub fn mark_running(&mut self) -> Result<(), WorkflowError> {
        self.transition(
            RunStatus::Running,
            &[RunStatus::Validating, RunStatus::Failed, RunStatus::Cancelled],
        )?;
        self.last_error = None;
        Ok(())
    }

    /// Record that the stage at `index` committed and the run moved past it.
    pub fn advance_past(&mut self, index: usize) -> Result<(), WorkflowError> {
        if self.status != RunStatus::Running {
            return Err(WorkflowError::InvalidTransition {
                run_id: self.id.to_string(),
                from: self.status.to_string(),
                to: "running(advance)".to_string(),
            });
        }
        self.current_stage = index + 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Running → Completed: the last stage committed.
    pub fn complete(&mut self) -> Result<(), WorkflowError> {
        self.transition(RunStatus::Completed, &[RunStatus::Running])
    }

    /// Running → Failed: a stage exhausted its retry budget. Resumable;
    /// the diagnostic names the failing stage and attempt count.
    pub fn fail(&mut self, error: &str) -> Result<(), WorkflowError> {
        self.transition(RunStatus::Failed, &[RunStatus::Running])?;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Running/Validating → Cancelled. Checked only at stage boundaries.
    pub fn cancel(&mut self) -> Result<(), WorkflowError> {
        self.transition(
            RunStatus::Cancelled,
            &[RunStatus::Running, RunStatus::Validating],
        )
    }

    /// Stage name at `index`, if within the pipeline.
    pub fn stage_name(&self, index: usize) -> Option<&str> {
        self.stages.get(index).map(String::as_str)
    }
}

/// Execution status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One attempt at one stage. A retry supersedes the prior execution; the
/// last record per stage is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub run_id: Uuid,
    pub stage: String,
    pub attempt: u32,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl StageExecution {
    pub fn start(run_id: Uuid, stage: &str, attempt: u32) -> Self {
        Self {
            run_id,
            stage: stage.to_string(),
            attempt,
            status: StageStatus::Running,
            duration_ms: 0,
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn succeed(&mut self, duration_ms: u64) {
        self.status = StageStatus::Succeeded;
        self.duration_ms = duration_ms;
        self.error = None;
    }

    pub fn fail(&mut self, duration_ms: u64, error: &str) {
        self.status = StageStatus::Failed;
        self.duration_ms = duration_ms;
        self.error = Some(error.to_string());
    }
}

/// Durable run records, one `run.json` per run directory.
///
/// Needed so `status` and `resume` survive a process restart; the
/// coordinator is the only writer.
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self { runs_dir }
    }

    fn path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join("run.json")
    }

    pub fn save(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        atomic_write_json(&self.path(run.id), "run record", run)
    }

    pub fn load(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let path = self.path(run_id);
        match read_json::<WorkflowRun>(&path)? {
            None => Err(StoreError::NotFound {
                run_id: run_id.to_string(),
            }),
            Some(Err(e)) => Err(StoreError::Serialize {
                what: format!("run record at {}", path.display()),
                source: e,
            }),
            Some(Ok(run)) => Ok(run),
        }
    }

    /// All persisted runs, oldest first. Unparseable entries are skipped;
    /// a corrupt neighbor must not hide healthy runs from `status`.
    pub fn list(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.runs_dir).map_err(|source| {
            StoreError::Unavailable {
                path: self.runs_dir.clone(),
                source,
            }
        })?;

        let mut runs = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path().join("run.json");
            if let Ok(Some(Ok(run))) = read_json::<WorkflowRun>(&path) {
                runs.push(run);
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}
