//! Per-stage artifact storage.
//!
//! One current artifact per (run, stage): a retried stage overwrites its
//! prior artifact rather than appending, so `list` stays a clean 1:1 map
//! from committed stage to artifact. Artifact writes happen before the
//! checkpoint write; an artifact without a checkpoint entry is an
//! uncommitted leftover that resume will overwrite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::stage::{ArtifactKind, StageOutput};
use crate::store::{atomic_write_json, read_json};

/// Durable output produced by one stage of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub run_id: Uuid,
    pub stage: String,
    pub kind: ArtifactKind,
    pub content: StageOutput,
    pub created_at: DateTime<Utc>,
}

/// Artifact persistence, one `artifacts/<stage>.json` per run directory.
pub struct ArtifactStore {
    runs_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self { runs_dir }
    }

    fn path(&self, run_id: Uuid, stage: &str) -> PathBuf {
        self.runs_dir
            .join(run_id.to_string())
            .join("artifacts")
            .join(format!("{stage}.json"))
    }

    /// Store the current artifact for (run, stage), replacing any prior one.
    /// Returns the artifact id (`<run_id>/<stage>`).
    pub fn put(
        &self,
        run_id: Uuid,
        stage: &str,
        kind: ArtifactKind,
        content: StageOutput,
    ) -> Result<String, StoreError> {
        let artifact = Artifact {
            run_id,
            stage: stage.to_string(),
            kind,
            content,
            created_at: Utc::now(),
        };
        atomic_write_json(&self.path(run_id, stage), "artifact", &artifact)?;
        Ok(format!("{run_id}/{stage}"))
    }

    /// Fetch the current artifact for (run, stage).
    pub fn get(&self, run_id: Uuid, stage: &str) -> Result<Artifact, StoreError> {
        let path = self.path(run_id, stage);
        match read_json::<Artifact>(&path)? {
            None => Err(StoreError::NotFound {
                run_id: format!("{run_id}/{stage}"),
            }),
            Some(Err(e)) => Err(StoreError::Serialize {
                what: format!("artifact at {}", path.display()),
                source: e,
            }),
            Some(Ok(artifact)) => Ok(artifact),
        }
    }

    /// All artifacts for a run, in the given fixed stage order. Stages
    /// without an artifact are simply absent.
    pub fn list(&self, run_id: Uuid, stage_order: &[String]) -> Result<Vec<Artifact>, StoreError> {
        let mut artifacts = Vec::new();
        for stage in stage_order {
            match self.get(run_id, stage) {
                Ok(artifact) => artifacts.push(artifact),
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ArtifactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ArtifactStore::new(dir.path().to_path_buf()), dir)
    }

    fn plan_output(summary: &str) -> StageOutput {
        StageOutput::Plan {
            summary: summary.to_string(),
            steps: vec!["step one".into()],
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let id = store
            .put(run_id, "plan", ArtifactKind::Plan, plan_output("v1"))
            .unwrap();
        assert_eq!(id, format!("{run_id}/plan"));

        let artifact = store.get(run_id, "plan").unwrap();
        assert_eq!(artifact.stage, "plan");
        assert_eq!(artifact.kind, ArtifactKind::Plan);
        match artifact.content {
            StageOutput::Plan { summary, .. } => assert_eq!(summary, "v1"),
            other => panic!("expected Plan, got {other:?}"),
        }
    }

    #[test]
    fn retry_overwrites_instead_of_appending() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        store
            .put(run_id, "plan", ArtifactKind::Plan, plan_output("first"))
            .unwrap();
        store
            .put(run_id, "plan", ArtifactKind::Plan, plan_output("second"))
            .unwrap();

        let order = vec!["plan".to_string()];
        let listed = store.list(run_id, &order).unwrap();
        assert_eq!(listed.len(), 1, "one current artifact per stage");
        match &listed[0].content {
            StageOutput::Plan { summary, .. } => assert_eq!(summary, "second"),
            other => panic!("expected Plan, got {other:?}"),
        }
    }

    #[test]
    fn list_follows_fixed_stage_order() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        // Written out of order on purpose.
        store
            .put(run_id, "plan", ArtifactKind::Plan, plan_output("p"))
            .unwrap();
        store
            .put(
                run_id,
                "research",
                ArtifactKind::ResearchNotes,
                StageOutput::Research {
                    findings: "found things".into(),
                    sources: vec![],
                },
            )
            .unwrap();

        let order = vec!["research".to_string(), "plan".to_string()];
        let listed = store.list(run_id, &order).unwrap();
        let stages: Vec<&str> = listed.iter().map(|a| a.stage.as_str()).collect();
        assert_eq!(stages, vec!["research", "plan"]);
    }

    #[test]
    fn get_missing_artifact_is_not_found() {
        let (store, _dir) = store();
        let err = store.get(Uuid::new_v4(), "plan").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn runs_do_not_see_each_others_artifacts() {
        let (store, _dir) = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .put(a, "plan", ArtifactKind::Plan, plan_output("for a"))
            .unwrap();

        assert!(store.get(b, "plan").is_err());
        let order = vec!["plan".to_string()];
        assert!(store.list(b, &order).unwrap().is_empty());
    }
}
