//! The pipeline coordinator - the engine's top-level state machine.
//!
//! The coordinator owns every `WorkflowRun`, drives the fixed stage loop,
//! persists artifacts and checkpoints after each committed stage, applies
//! per-stage retry policy, and exposes exactly four operations as its
//! public boundary: `start`, `resume`, `status`, `cancel`.
//!
//! Within one run everything is strictly sequential: stage i+1 never starts
//! before stage i's artifact and checkpoint are durably committed, because
//! each stage consumes prior stages' artifacts as input. Distinct runs are
//! independent and may execute concurrently; shared stores are partitioned
//! by run id and serialized per run id.

mod engine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::alignment::{AlignmentCapability, AlignmentResult, AlignmentValidator};
use crate::config::Config;
use crate::errors::{StoreError, WorkflowError};
use crate::invoker::{AgentInvoker, StageCapability};
use crate::journal::WorkflowLogger;
use crate::retry::RetryPolicy;
use crate::run::{RunStatus, RunStore, WorkflowRun};
use crate::stage::{ArtifactKind, Stage};
use crate::store::{ArtifactStore, Checkpoint, CheckpointStore, RunLocks};

/// Everything `status` reports about one run.
#[derive(Debug)]
pub struct RunReport {
    pub run: WorkflowRun,
    pub checkpoint: Option<Checkpoint>,
    pub alignment: Option<AlignmentResult>,
    pub artifacts: Vec<ArtifactEntry>,
}

/// One committed artifact, as listed in a report.
#[derive(Debug)]
pub struct ArtifactEntry {
    pub stage: String,
    pub kind: ArtifactKind,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct PipelineCoordinator {
    config: Config,
    stages: Vec<Stage>,
    run_store: RunStore,
    checkpoints: CheckpointStore,
    artifacts: ArtifactStore,
    logger: WorkflowLogger,
    validator: AlignmentValidator,
    invoker: AgentInvoker,
    locks: RunLocks,
    storage_policy: RetryPolicy,
    /// Cooperative cancellation flags for runs executing in this process.
    cancels: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl PipelineCoordinator {
    pub fn new(
        config: Config,
        stage_capability: Arc<dyn StageCapability>,
        alignment_capability: Arc<dyn AlignmentCapability>,
    ) -> anyhow::Result<Self> {
        config.ensure_dirs()?;
        let runs_dir = config.runs_dir.clone();
        let stages = config.stages();
        Ok(Self {
            run_store: RunStore::new(runs_dir.clone()),
            checkpoints: CheckpointStore::new(runs_dir.clone()),
            artifacts: ArtifactStore::new(runs_dir.clone()),
            logger: WorkflowLogger::new(runs_dir.clone(), config.defaults.summary_cap_chars),
            validator: AlignmentValidator::new(alignment_capability, runs_dir.clone()),
            invoker: AgentInvoker::new(stage_capability),
            locks: RunLocks::new(runs_dir),
            storage_policy: RetryPolicy::storage_profile(),
            cancels: Mutex::new(HashMap::new()),
            stages,
            config,
        })
    }

    /// Override the backoff profile applied to store writes. The default is
    /// the long-backoff storage profile; tests substitute a fast one.
    pub fn with_storage_policy(mut self, policy: RetryPolicy) -> Self {
        self.storage_policy = policy;
        self
    }

    /// Submit a feature request: gate it, then drive the stage loop to a
    /// terminal or resumable state. The returned run carries the outcome
    /// (`Aborted`, `Completed`, `Failed`, or `Cancelled`); its journal and
    /// report carry the detail.
    pub async fn start(&self, request: &str) -> Result<WorkflowRun, WorkflowError> {
        let stage_names = self.stages.iter().map(|s| s.name.clone()).collect();
        let mut run = WorkflowRun::new(request, stage_names);
        let _guard = self.locks.try_acquire(run.id)?;
        let cancel = self.register_cancel(run.id);

        self.persist_run(&run).await?;
        tracing::info!(run_id = %run.id, request, "run created");

        let outcome = self.execute(&mut run, cancel).await;
        self.unregister_cancel(run.id);
        outcome?;
        Ok(run)
    }

    /// Continue a run from its first incomplete stage. Idempotent for
    /// completed runs: returns immediately without invoking any stage.
    pub async fn resume(&self, run_id: Uuid) -> Result<WorkflowRun, WorkflowError> {
        let mut run = self.load_run(run_id)?;

        if run.status == RunStatus::Completed {
            tracing::info!(run_id = %run.id, "resume of completed run is a no-op");
            return Ok(run);
        }
        if run.status == RunStatus::Aborted {
            return Err(WorkflowError::InvalidTransition {
                run_id: run.id.to_string(),
                from: "aborted".to_string(),
                to: "running".to_string(),
            });
        }

        let _guard = self.locks.try_acquire(run.id)?;
        // Refuse rather than race: a corrupted checkpoint must be discarded
        // explicitly before the run can move again.
        self.checkpoints.load(run.id)?;

        let cancel = self.register_cancel(run.id);
        let outcome = self.execute(&mut run, cancel).await;
        self.unregister_cancel(run.id);
        outcome?;
        Ok(run)
    }

    /// Report a run's current state: the run record, its checkpoint, its
    /// alignment verdict, and every committed artifact in stage order.
    pub fn status(&self, run_id: Uuid) -> Result<RunReport, WorkflowError> {
        let run = self.load_run(run_id)?;
        let checkpoint = self.checkpoints.load(run_id)?;
        let alignment = self.validator.cached(run_id)?;
        let artifacts = self
            .artifacts
            .list(run_id, &run.stages)?
            .into_iter()
            .map(|a| ArtifactEntry {
                stage: a.stage,
                kind: a.kind,
                created_at: a.created_at,
            })
            .collect();
        Ok(RunReport {
            run,
            checkpoint,
            alignment,
            artifacts,
        })
    }

    /// Request cooperative cancellation. An executing run stops at the next
    /// stage boundary; an idle (crashed or externally driven) run is
    /// transitioned directly.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), WorkflowError> {
        if let Some(flag) = self
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
        {
            flag.store(true, Ordering::SeqCst);
            tracing::info!(run_id = %run_id, "cancellation requested; honored at next stage boundary");
            return Ok(());
        }

        let mut run = self.load_run(run_id)?;
        run.cancel()?;
        self.persist_run(&run).await?;
        self.logger
            .log_event(run_id, None, "run cancelled", serde_json::json!({}))?;
        Ok(())
    }

    fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, WorkflowError> {
        match self.run_store.load(run_id) {
            Ok(run) => Ok(run),
            Err(StoreError::NotFound { .. }) => Err(WorkflowError::RunNotFound {
                run_id: run_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn register_cancel(&self, run_id: Uuid) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id, flag.clone());
        flag
    }

    fn unregister_cancel(&self, run_id: Uuid) {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);
    }
}
