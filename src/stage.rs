//! Stage templates and stage output payloads.
//!
//! This module provides:
//! - `Stage` — immutable per-stage configuration shared across runs
//! - `default_stages` — the fixed seven-stage development pipeline
//! - `ArtifactKind` — what kind of artifact each stage produces
//! - `StageOutput` — the tagged union every capability response must match
//!
//! Stages are templates, not entities: they carry no lifecycle of their own.
//! A run owns its ordered stage list and never reorders it.

use serde::{Deserialize, Serialize};

use crate::errors::InvokeError;

/// Default per-stage invocation timeout.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;
/// Default retry budget (attempts = 1 initial + max_retries).
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// The kind of artifact a stage produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    ResearchNotes,
    Plan,
    TestManifest,
    ChangeSet,
    ReviewNotes,
    SecurityReport,
    DocUpdate,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactKind::ResearchNotes => "research-notes",
            ArtifactKind::Plan => "plan",
            ArtifactKind::TestManifest => "test-manifest",
            ArtifactKind::ChangeSet => "change-set",
            ArtifactKind::ReviewNotes => "review-notes",
            ArtifactKind::SecurityReport => "security-report",
            ArtifactKind::DocUpdate => "doc-update",
        };
        write!(f, "{s}")
    }
}

/// Immutable configuration for one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    /// Stage name (e.g., "write-tests"). Doubles as the storage key.
    pub name: String,
    /// Fixed position in the pipeline.
    pub index: usize,
    /// Kind of artifact this stage commits.
    pub kind: ArtifactKind,
    /// Retry budget beyond the initial attempt.
    pub max_retries: u32,
    /// Invocation timeout in seconds.
    pub timeout_secs: u64,
    /// Whether a schema-mismatch failure may be retried (default: no).
    #[serde(default)]
    pub retry_on_schema_mismatch: bool,
    /// Instructions handed to the stage capability alongside prior artifacts.
    pub instructions: String,
}

impl Stage {
    pub fn new(name: &str, index: usize, kind: ArtifactKind, instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            index,
            kind,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            retry_on_schema_mismatch: false,
            instructions: instructions.to_string(),
        }
    }
}

/// The fixed development pipeline, in execution order.
pub fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new(
            "research",
            0,
            ArtifactKind::ResearchNotes,
            "Survey the codebase and prior art relevant to the request. \
             Report findings and the sources consulted.",
        ),
        Stage::new(
            "plan",
            1,
            ArtifactKind::Plan,
            "Produce an ordered implementation plan from the research notes.",
        ),
        Stage::new(
            "write-tests",
            2,
            ArtifactKind::TestManifest,
            "Write failing tests covering the planned behavior. \
             Enumerate every test identifier added.",
        ),
        Stage::new(
            "implement",
            3,
            ArtifactKind::ChangeSet,
            "Implement the plan until the written tests pass. \
             Report the change-set reference and files touched.",
        ),
        Stage::new(
            "review",
            4,
            ArtifactKind::ReviewNotes,
            "Review the change-set against the plan and report findings.",
        ),
        Stage::new(
            "security-check",
            5,
            ArtifactKind::SecurityReport,
            "Audit the change-set for security issues and report them.",
        ),
        Stage::new(
            "document",
            6,
            ArtifactKind::DocUpdate,
            "Update project documentation for the implemented change. \
             List every document updated.",
        ),
    ]
}

/// Structured output a stage capability must return, one variant per stage.
///
/// The variant tag must match the invoked stage name; the invoker rejects a
/// well-formed payload for the wrong stage the same way it rejects a
/// malformed one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", rename_all = "kebab-case")]
pub enum StageOutput {
    Research {
        findings: String,
        #[serde(default)]
        sources: Vec<String>,
    },
    Plan {
        summary: String,
        steps: Vec<String>,
    },
    WriteTests {
        manifest: String,
        tests: Vec<String>,
    },
    Implement {
        change_set: String,
        #[serde(default)]
        files_touched: Vec<String>,
    },
    Review {
        notes: String,
        #[serde(default)]
        issues: Vec<String>,
    },
    SecurityCheck {
        report: String,
        #[serde(default)]
        findings: Vec<String>,
    },
    Document {
        summary: String,
        updates: Vec<String>,
    },
}

impl StageOutput {
    /// The stage name this output belongs to.
    pub fn stage_name(&self) -> &'static str {
        match self {
            StageOutput::Research { .. } => "research",
            StageOutput::Plan { .. } => "plan",
            StageOutput::WriteTests { .. } => "write-tests",
            StageOutput::Implement { .. } => "implement",
            StageOutput::Review { .. } => "review",
            StageOutput::SecurityCheck { .. } => "security-check",
            StageOutput::Document { .. } => "document",
        }
    }

    /// A short human-readable digest, used for checkpoint stats and the
    /// journal. Bounded by the caller, not here.
    pub fn summary(&self) -> String {
        match self {
            StageOutput::Research { findings, sources } => {
                format!("{} ({} sources)", first_line(findings), sources.len())
            }
            StageOutput::Plan { summary, steps } => {
                format!("{} ({} steps)", first_line(summary), steps.len())
            }
            StageOutput::WriteTests { manifest, tests } => {
                format!("{} ({} tests)", first_line(manifest), tests.len())
            }
            StageOutput::Implement {
                change_set,
                files_touched,
            } => format!("{change_set} ({} files)", files_touched.len()),
            StageOutput::Review { notes, issues } => {
                format!("{} ({} issues)", first_line(notes), issues.len())
            }
            StageOutput::SecurityCheck { report, findings } => {
                format!("{} ({} findings)", first_line(report), findings.len())
            }
            StageOutput::Document { summary, updates } => {
                format!("{} ({} docs)", first_line(summary), updates.len())
            }
        }
    }

    /// Describe the shape the named stage is expected to return. Used in
    /// `OutputShape` diagnostics.
    pub fn expected_shape(stage: &str) -> &'static str {
        match stage {
            "research" => "{stage: research, findings: non-empty string, sources: [string]}",
            "plan" => "{stage: plan, summary: string, steps: non-empty list}",
            "write-tests" => "{stage: write-tests, manifest: string, tests: non-empty list}",
            "implement" => "{stage: implement, change_set: non-empty string, files_touched: [string]}",
            "review" => "{stage: review, notes: non-empty string, issues: [string]}",
            "security-check" => "{stage: security-check, report: non-empty string, findings: [string]}",
            "document" => "{stage: document, summary: string, updates: non-empty list}",
            _ => "unknown stage",
        }
    }

    /// Parse and structurally validate a capability response for `stage`.
    ///
    /// Only structure is checked here. A well-formed but semantically wrong
    /// result is out of scope; content quality is the capability's problem.
    pub fn validate(stage: &str, value: &serde_json::Value) -> Result<Self, InvokeError> {
        let mismatch = |actual: String| InvokeError::OutputShape {
            stage: stage.to_string(),
            expected: Self::expected_shape(stage).to_string(),
            actual,
        };

        let output: StageOutput = serde_json::from_value(value.clone())
            .map_err(|e| mismatch(format!("unparseable payload: {e}")))?;

        if output.stage_name() != stage {
            return Err(mismatch(format!(
                "payload tagged for stage '{}'",
                output.stage_name()
            )));
        }

        match &output {
            StageOutput::Research { findings, .. } if findings.trim().is_empty() => {
                Err(mismatch("empty findings".into()))
            }
            StageOutput::Plan { steps, .. } if steps.is_empty() => {
                Err(mismatch("empty step list".into()))
            }
            StageOutput::WriteTests { tests, .. } if tests.is_empty() => {
                Err(mismatch("empty test list".into()))
            }
            StageOutput::WriteTests { tests, .. }
                if tests.iter().any(|t| t.trim().is_empty()) =>
            {
                Err(mismatch("blank test identifier".into()))
            }
            StageOutput::Implement { change_set, .. } if change_set.trim().is_empty() => {
                Err(mismatch("empty change_set reference".into()))
            }
            StageOutput::Review { notes, .. } if notes.trim().is_empty() => {
                Err(mismatch("empty review notes".into()))
            }
            StageOutput::SecurityCheck { report, .. } if report.trim().is_empty() => {
                Err(mismatch("empty security report".into()))
            }
            StageOutput::Document { updates, .. } if updates.is_empty() => {
                Err(mismatch("empty update list".into()))
            }
            _ => Ok(output),
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}
