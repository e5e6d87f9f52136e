//! Stage capability invocation.
//!
//! `AgentInvoker` abstracts a single call to an external stage capability:
//! hand it structured input, get a structured output back, and validate the
//! shape before reporting success. The capability is opaque; how it decides
//! what to produce is not this component's business, and neither is
//! retrying - the coordinator owns the retry policy, which keeps this
//! component stateless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::errors::InvokeError;
use crate::stage::StageOutput;
use crate::store::Artifact;

/// An external, possibly AI-backed, capability performing one stage's work.
///
/// Implementations must return a JSON payload matching the stage's declared
/// output shape; the invoker validates it. Errors are capability-side
/// failures (spawn errors, non-zero exits, refusals).
#[async_trait]
pub trait StageCapability: Send + Sync {
    async fn execute(&self, stage: &str, input: &StageInput) -> anyhow::Result<serde_json::Value>;
}

/// One prior stage's committed output, handed to later stages as input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorArtifact {
    pub stage: String,
    pub content: StageOutput,
}

impl From<Artifact> for PriorArtifact {
    fn from(artifact: Artifact) -> Self {
        Self {
            stage: artifact.stage,
            content: artifact.content,
        }
    }
}

/// Structured input for one stage invocation: the original request, the
/// stage's instructions, and every prior artifact in pipeline order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub run_id: Uuid,
    pub request: String,
    pub instructions: String,
    pub prior_artifacts: Vec<PriorArtifact>,
}

/// Outcome of one successful invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub output: StageOutput,
    pub duration: Duration,
}

/// Stateless wrapper around a `StageCapability`.
pub struct AgentInvoker {
    capability: Arc<dyn StageCapability>,
}

impl AgentInvoker {
    pub fn new(capability: Arc<dyn StageCapability>) -> Self {
        Self { capability }
    }

    /// Invoke the capability for `stage` with an explicit timeout, then
    /// validate the returned shape. Never retries.
    pub async fn invoke(
        &self,
        stage: &str,
        input: &StageInput,
        timeout: Duration,
    ) -> Result<InvocationResult, InvokeError> {
        let started = Instant::now();

        let value = tokio::time::timeout(timeout, self.capability.execute(stage, input))
            .await
            .map_err(|_| InvokeError::Timeout {
                stage: stage.to_string(),
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|e| InvokeError::Capability {
                stage: stage.to_string(),
                message: format!("{e:#}"),
            })?;

        let output = StageOutput::validate(stage, &value)?;

        Ok(InvocationResult {
            output,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CannedCapability {
        value: serde_json::Value,
    }

    #[async_trait]
    impl StageCapability for CannedCapability {
        async fn execute(
            &self,
            _stage: &str,
            _input: &StageInput,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(self.value.clone())
        }
    }

    struct SlowCapability;

    #[async_trait]
    impl StageCapability for SlowCapability {
        async fn execute(
            &self,
            _stage: &str,
            _input: &StageInput,
        ) -> anyhow::Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    struct FailingCapability;

    #[async_trait]
    impl StageCapability for FailingCapability {
        async fn execute(
            &self,
            _stage: &str,
            _input: &StageInput,
        ) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("capability exploded")
        }
    }

    fn input() -> StageInput {
        StageInput {
            run_id: Uuid::new_v4(),
            request: "add a feature".into(),
            instructions: "do the stage".into(),
            prior_artifacts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn valid_output_is_accepted() {
        let invoker = AgentInvoker::new(Arc::new(CannedCapability {
            value: json!({
                "stage": "plan",
                "summary": "three step plan",
                "steps": ["a", "b", "c"],
            }),
        }));
        let result = invoker
            .invoke("plan", &input(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.output.stage_name(), "plan");
    }

    #[tokio::test]
    async fn slow_capability_times_out() {
        let invoker = AgentInvoker::new(Arc::new(SlowCapability));
        let err = invoker
            .invoke("research", &input(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn capability_failure_is_reported_as_such() {
        let invoker = AgentInvoker::new(Arc::new(FailingCapability));
        let err = invoker
            .invoke("research", &input(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            InvokeError::Capability { message, .. } => {
                assert!(message.contains("capability exploded"));
            }
            other => panic!("expected Capability, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_output_is_a_shape_error_not_a_capability_error() {
        let invoker = AgentInvoker::new(Arc::new(CannedCapability {
            value: json!({"stage": "write-tests", "manifest": "m", "tests": []}),
        }));
        let err = invoker
            .invoke("write-tests", &input(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::OutputShape { .. }));
    }

    #[test]
    fn stage_input_serializes_with_prior_artifacts() {
        let mut stage_input = input();
        stage_input.prior_artifacts.push(PriorArtifact {
            stage: "research".into(),
            content: StageOutput::Research {
                findings: "found".into(),
                sources: vec!["src/lib.rs".into()],
            },
        });
        let json = serde_json::to_value(&stage_input).unwrap();
        assert_eq!(json["prior_artifacts"][0]["stage"], "research");
        assert_eq!(json["prior_artifacts"][0]["content"]["stage"], "research");
    }
}
