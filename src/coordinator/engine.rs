//! Stage-loop internals of the coordinator.
//!
//! Commit protocol, per stage: invoke -> artifact write -> checkpoint write
//! -> run record. The checkpoint is the commit record; the artifact must be
//! durable before it. A crash between the two leaves an uncommitted
//! artifact that resume simply overwrites by re-executing the stage.

use anyhow::anyhow;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::PipelineCoordinator;
use crate::errors::{StoreError, WorkflowError};
use crate::invoker::{InvocationResult, PriorArtifact, StageInput};
use crate::journal::ContextBudget;
use crate::run::{RunStatus, StageExecution, WorkflowRun};
use crate::stage::Stage;
use crate::store::StageStats;

/// How one stage's retry loop ended.
enum StageOutcome {
    Committed,
    Exhausted,
}

impl PipelineCoordinator {
    /// Bring `run` from its current status to a settled one: gate it if it
    /// has not been gated, then drive the stage loop.
    pub(super) async fn execute(
        &self,
        run: &mut WorkflowRun,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), WorkflowError> {
        match run.status {
            RunStatus::Initialized => {
                run.begin_validation()?;
                self.persist_run(run).await?;
                if !self.gate(run).await? {
                    return Ok(());
                }
            }
            RunStatus::Validating => {
                if !self.gate(run).await? {
                    return Ok(());
                }
            }
            RunStatus::Failed | RunStatus::Cancelled => {
                run.mark_running()?;
                self.persist_run(run).await?;
                self.logger
                    .log_event(run.id, None, "run resumed", json!({}))?;
            }
            // A run left Running on disk is crash recovery: the checkpoint
            // says where to pick up.
            RunStatus::Running => {}
            RunStatus::Completed | RunStatus::Aborted => return Ok(()),
        }
        self.drive(run, cancel).await
    }

    /// The pre-flight alignment gate. Returns whether the run may proceed;
    /// a rejection settles the run as Aborted with zero stages executed.
    async fn gate(&self, run: &mut WorkflowRun) -> Result<bool, WorkflowError> {
        let timeout = Duration::from_secs(self.config.defaults.stage_timeout_secs);
        let result = tokio::time::timeout(
            timeout,
            self.validator
                .validate(run.id, &run.request, &self.config.spec_file),
        )
        .await
        .map_err(|_| {
            WorkflowError::Other(anyhow!(
                "alignment gate timed out after {}s",
                timeout.as_secs()
            ))
        })??;

        self.logger.log_event(
            run.id,
            None,
            &format!("alignment: {}", result.rationale),
            json!({
                "aligned": result.aligned,
                "matched_goals": result.matched_goals,
                "scope_violations": result.scope_violations,
            }),
        )?;

        if result.aligned {
            run.mark_running()?;
            self.persist_run(run).await?;
            Ok(true)
        } else {
            run.abort()?;
            self.persist_run(run).await?;
            tracing::warn!(run_id = %run.id, rationale = %result.rationale, "run aborted by alignment gate");
            Ok(false)
        }
    }

    /// Walk the fixed stage list from the first incomplete stage. Each
    /// iteration re-reads the checkpoint, so the loop is also the resume
    /// path and the completion path.
    async fn drive(
        &self,
        run: &mut WorkflowRun,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), WorkflowError> {
        loop {
            let next = self.checkpoints.get_resume_stage(run.id, &run.stages)?;
            let Some(stage_name) = next else {
                run.complete()?;
                self.persist_run(run).await?;
                self.logger
                    .log_event(run.id, None, "run completed", json!({}))?;
                tracing::info!(run_id = %run.id, "run completed");
                return Ok(());
            };

            // Cooperative cancellation, checked only at stage boundaries.
            if cancel.load(Ordering::SeqCst) {
                run.cancel()?;
                self.persist_run(run).await?;
                self.logger.log_event(
                    run.id,
                    None,
                    "run cancelled at stage boundary",
                    json!({"next_stage": stage_name}),
                )?;
                return Ok(());
            }

            let stage = self
                .stages
                .iter()
                .find(|s| s.name == stage_name)
                .ok_or_else(|| {
                    WorkflowError::Other(anyhow!("run references unknown stage '{stage_name}'"))
                })?;

            match self.run_stage(run, stage).await? {
                StageOutcome::Committed => {}
                StageOutcome::Exhausted => return Ok(()),
            }
        }
    }

    /// Execute one stage under its retry policy.
    async fn run_stage(
        &self,
        run: &mut WorkflowRun,
        stage: &Stage,
    ) -> Result<StageOutcome, WorkflowError> {
        let policy = self.config.retry_policy_for(stage);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut execution = StageExecution::start(run.id, &stage.name, attempt);
            self.logger.log_event(
                run.id,
                Some(&stage.name),
                &format!("attempt {attempt} started"),
                json!({"attempt": attempt}),
            )?;

            let input = self.build_input(run, stage)?;
            let started = Instant::now();
            let result = self
                .invoker
                .invoke(&stage.name, &input, Duration::from_secs(stage.timeout_secs))
                .await;

            match result {
                Ok(invocation) => {
                    execution.succeed(invocation.duration.as_millis() as u64);
                    if let Err(e) = self.commit_stage(run, stage, &invocation, attempt).await {
                        // Storage gave out mid-commit. The checkpoint was
                        // not written, so resume re-executes this stage.
                        let diagnostic = format!(
                            "storage failure committing stage '{}': {e}",
                            stage.name
                        );
                        if run.fail(&diagnostic).is_ok() {
                            if let Err(persist_err) = self.persist_run(run).await {
                                tracing::error!(run_id = %run.id, error = %persist_err,
                                    "failed to persist failed run record");
                            }
                        }
                        return Err(e);
                    }
                    self.logger.log_event(
                        run.id,
                        Some(&stage.name),
                        &format!("committed: {}", invocation.output.summary()),
                        serde_json::to_value(&execution).unwrap_or_default(),
                    )?;
                    return Ok(StageOutcome::Committed);
                }
                Err(e) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    execution.fail(duration_ms, &e.to_string());
                    self.logger.log_event(
                        run.id,
                        Some(&stage.name),
                        &format!("attempt {attempt} failed: {e}"),
                        serde_json::to_value(&execution).unwrap_or_default(),
                    )?;

                    let retryable = e.is_retryable(stage.retry_on_schema_mismatch);
                    if !retryable || attempt >= policy.max_attempts() {
                        let diagnostic = WorkflowError::StageExhausted {
                            stage: stage.name.clone(),
                            attempts: attempt,
                            last_error: e,
                        }
                        .to_string();
                        run.fail(&diagnostic)?;
                        self.persist_run(run).await?;
                        self.logger.log_event(
                            run.id,
                            None,
                            &format!("run failed at stage '{}'", stage.name),
                            json!({"stage": stage.name, "attempts": attempt}),
                        )?;
                        tracing::warn!(run_id = %run.id, stage = %stage.name, attempts = attempt,
                            "run failed; checkpoint intact, resumable");
                        return Ok(StageOutcome::Exhausted);
                    }

                    let delay = policy.delay_for(attempt);
                    self.logger.log_event(
                        run.id,
                        Some(&stage.name),
                        &format!("retry {attempt} scheduled"),
                        json!({"backoff_ms": delay.as_millis() as u64}),
                    )?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Commit a successful invocation: artifact, then checkpoint, then run
    /// record and context accounting.
    async fn commit_stage(
        &self,
        run: &mut WorkflowRun,
        stage: &Stage,
        invocation: &InvocationResult,
        attempt: u32,
    ) -> Result<(), WorkflowError> {
        let run_id = run.id;
        let duration_ms = invocation.duration.as_millis() as u64;
        let summary = invocation.output.summary();

        let output = invocation.output.clone();
        self.with_storage_retry(run_id, "artifact", || {
            self.artifacts
                .put(run_id, &stage.name, stage.kind, output.clone())
        })
        .await?;

        let stats = StageStats::new(duration_ms, &summary, attempt);
        self.with_storage_retry(run_id, "checkpoint", || {
            self.checkpoints
                .save_stage(run_id, &stage.name, stats.clone())
        })
        .await?;

        run.advance_past(stage.index)?;

        // Context accounting: charged only with the bounded digest.
        let digest = self.logger.summarize(run_id)?;
        let mut budget = ContextBudget::new(
            self.config.defaults.context_limit_chars,
            run.context_chars,
        );
        if budget.charge(digest.chars().count()) {
            self.logger.log_event(
                run_id,
                None,
                "context budget exceeded; consider resetting caller context before continuing",
                json!({
                    "used_chars": budget.used_chars(),
                    "limit_chars": self.config.defaults.context_limit_chars,
                    "usage_percent": budget.usage_percentage(),
                }),
            )?;
            tracing::warn!(run_id = %run_id, used = budget.used_chars(), "context budget advisory");
        }
        run.context_chars = budget.used_chars();

        self.persist_run(run).await?;
        Ok(())
    }

    /// Assemble a stage's input: the original request, this stage's
    /// instructions, and every committed artifact in pipeline order.
    fn build_input(&self, run: &WorkflowRun, stage: &Stage) -> Result<StageInput, WorkflowError> {
        let prior_artifacts = self
            .artifacts
            .list(run.id, &run.stages)?
            .into_iter()
            .map(PriorArtifact::from)
            .collect();
        Ok(StageInput {
            run_id: run.id,
            request: run.request.clone(),
            instructions: stage.instructions.clone(),
            prior_artifacts,
        })
    }

    pub(super) async fn persist_run(&self, run: &WorkflowRun) -> Result<(), WorkflowError> {
        self.with_storage_retry(run.id, "run record", || self.run_store.save(run))
            .await
            .map_err(Into::into)
    }

    /// Run a storage operation under the long-backoff profile: transient
    /// unavailability stalls the run instead of failing it, up to the
    /// profile's outer budget.
    async fn with_storage_retry<T, F>(
        &self,
        run_id: Uuid,
        what: &str,
        op: F,
    ) -> Result<T, StoreError>
    where
        F: Fn() -> Result<T, StoreError>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.storage_policy.max_attempts() => {
                    tracing::warn!(run_id = %run_id, what, attempt, error = %e,
                        "storage stalled; backing off");
                    tokio::time::sleep(self.storage_policy.delay_for(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
