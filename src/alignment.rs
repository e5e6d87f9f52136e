//! Pre-flight alignment gate.
//!
//! Before any stage executes, the requested feature is checked against the
//! project specification's goals, scope, and constraints. The judgement
//! itself is delegated to an opaque capability; this module parses the spec
//! document, invokes the capability, validates the response shape, and
//! caches the result so it is computed exactly once per run.
//!
//! A missing or unparseable spec document short-circuits to a rejection
//! with rationale "specification missing/invalid" - terminal for the run,
//! never retried. The gate itself creates no artifacts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::specdoc::{self, ProjectSpec};
use crate::store::{atomic_write_json, read_json};

/// Opaque capability judging whether a request fits the project spec.
#[async_trait]
pub trait AlignmentCapability: Send + Sync {
    async fn assess(&self, request: &str, spec: &ProjectSpec)
    -> anyhow::Result<serde_json::Value>;
}

/// Immutable verdict of the gate for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub run_id: Uuid,
    pub aligned: bool,
    #[serde(default)]
    pub matched_goals: Vec<String>,
    #[serde(default)]
    pub scope_violations: Vec<String>,
    #[serde(default)]
    pub constraint_violations: Vec<String>,
    pub rationale: String,
}

impl AlignmentResult {
    fn rejected(run_id: Uuid, rationale: String) -> Self {
        Self {
            run_id,
            aligned: false,
            matched_goals: Vec::new(),
            scope_violations: Vec::new(),
            constraint_violations: Vec::new(),
            rationale,
        }
    }
}

/// The shape the capability must return.
#[derive(Debug, Deserialize)]
struct AssessmentPayload {
    aligned: bool,
    #[serde(default)]
    matched_goals: Vec<String>,
    #[serde(default)]
    scope_violations: Vec<String>,
    #[serde(default)]
    constraint_violations: Vec<String>,
    rationale: String,
}

/// Gates a run before any stage executes.
pub struct AlignmentValidator {
    capability: Arc<dyn AlignmentCapability>,
    runs_dir: PathBuf,
    cache: Mutex<HashMap<Uuid, AlignmentResult>>,
}

impl AlignmentValidator {
    pub fn new(capability: Arc<dyn AlignmentCapability>, runs_dir: PathBuf) -> Self {
        Self {
            capability,
            runs_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn result_path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir
            .join(run_id.to_string())
            .join("alignment.json")
    }

    /// Previously computed result for this run, if any (memory, then disk).
    pub fn cached(&self, run_id: Uuid) -> Result<Option<AlignmentResult>, WorkflowError> {
        if let Some(result) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
        {
            return Ok(Some(result.clone()));
        }
        match read_json::<AlignmentResult>(&self.result_path(run_id))? {
            Some(Ok(result)) => {
                self.remember(result.clone());
                Ok(Some(result))
            }
            // alignment.json is immutable once written; an unparseable one
            // means hand-editing, so recompute rather than trust it.
            Some(Err(_)) | None => Ok(None),
        }
    }

    fn remember(&self, result: AlignmentResult) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(result.run_id, result);
    }

    fn persist(&self, result: &AlignmentResult) -> Result<(), WorkflowError> {
        atomic_write_json(&self.result_path(result.run_id), "alignment result", result)?;
        self.remember(result.clone());
        Ok(())
    }

    /// Run the gate for `run_id`. Computed once: a cached result is
    /// returned as-is, without re-invoking the capability.
    pub async fn validate(
        &self,
        run_id: Uuid,
        request: &str,
        spec_path: &Path,
    ) -> Result<AlignmentResult, WorkflowError> {
        if let Some(result) = self.cached(run_id)? {
            return Ok(result);
        }

        let spec = match specdoc::parse(spec_path) {
            Ok(spec) => spec,
            Err(e) => {
                let result = AlignmentResult::rejected(
                    run_id,
                    format!("specification missing/invalid: {e}"),
                );
                self.persist(&result)?;
                return Ok(result);
            }
        };

        let value = self
            .capability
            .assess(request, &spec)
            .await
            .map_err(|e| WorkflowError::Other(e.context("alignment capability failed")))?;

        let payload: AssessmentPayload = serde_json::from_value(value).map_err(|e| {
            WorkflowError::Other(anyhow::anyhow!(
                "alignment capability returned malformed response: {e}"
            ))
        })?;

        let result = AlignmentResult {
            run_id,
            aligned: payload.aligned,
            matched_goals: payload.matched_goals,
            scope_violations: payload.scope_violations,
            constraint_violations: payload.constraint_violations,
            rationale: payload.rationale,
        };
        self.persist(&result)?;
        Ok(result)
    }
}

/// Deterministic lexical fallback: aligned unless the request overlaps an
/// out-of-scope item. Used when no model-backed capability is configured,
/// and by tests that need predictable verdicts.
pub struct LexicalAlignment;

#[async_trait]
impl AlignmentCapability for LexicalAlignment {
    async fn assess(
        &self,
        request: &str,
        spec: &ProjectSpec,
    ) -> anyhow::Result<serde_json::Value> {
        let request_lower = request.to_lowercase();
        let words: Vec<&str> = request_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3)
            .collect();

        let overlaps = |item: &str| {
            let item = item.to_lowercase();
            words.iter().any(|w| item.contains(w))
        };

        let scope_violations: Vec<String> =
            spec.scope_out.iter().filter(|s| overlaps(s)).cloned().collect();
        let matched_goals: Vec<String> =
            spec.goals.iter().filter(|g| overlaps(g)).cloned().collect();

        let aligned = scope_violations.is_empty();
        let rationale = if aligned {
            format!("request matches {} goal(s), no scope violations", matched_goals.len())
        } else {
            format!("request overlaps out-of-scope items: {}", scope_violations.join("; "))
        };

        Ok(serde_json::json!({
            "aligned": aligned,
            "matched_goals": matched_goals,
            "scope_violations": scope_violations,
            "constraint_violations": [],
            "rationale": rationale,
        }))
    }
}
