//! Append-only run journal and context-budget accounting.
//!
//! Every notable moment in a run (attempt started, stage committed, retry
//! scheduled, advisory raised) is appended as one JSON line to the run's
//! `events.jsonl`. Events carry enough metadata to reconstruct run history
//! without replaying any stage.
//!
//! `summarize` is the context-control mechanism: it produces a size-bounded
//! digest (latest event per stage) instead of the raw log, and it is the
//! only thing allowed to feed the run's context budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::StoreError;

/// Default digest cap in characters (roughly a few hundred words).
pub const DEFAULT_SUMMARY_CAP_CHARS: usize = 1200;
/// Default working-context advisory threshold in characters.
pub const DEFAULT_CONTEXT_LIMIT_CHARS: usize = 240_000;

/// One journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Append-only structured event log, one `events.jsonl` per run directory.
pub struct WorkflowLogger {
    runs_dir: PathBuf,
    summary_cap_chars: usize,
}

impl WorkflowLogger {
    pub fn new(runs_dir: PathBuf, summary_cap_chars: usize) -> Self {
        Self {
            runs_dir,
            summary_cap_chars,
        }
    }

    fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join("events.jsonl")
    }

    /// Append one event. Events are never rewritten or reordered.
    pub fn log_event(
        &self,
        run_id: Uuid,
        stage: Option<&str>,
        message: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        let record = EventRecord {
            run_id,
            stage: stage.map(str::to_string),
            message: message.to_string(),
            metadata,
            timestamp: Utc::now(),
        };
        let line = serde_json::to_string(&record).map_err(|source| StoreError::Serialize {
            what: "journal event".to_string(),
            source,
        })?;

        let path = self.events_path(run_id);
        let unavailable = |source: std::io::Error| StoreError::Unavailable {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unavailable)?;
        writeln!(file, "{line}").map_err(unavailable)?;

        tracing::debug!(run_id = %run_id, stage, message, "journal event");
        Ok(())
    }

    /// All events for a run, in append order. Unparseable lines (e.g. a
    /// torn tail write) are skipped rather than poisoning the whole log.
    pub fn read_events(&self, run_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        let path = self.events_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Unavailable {
            path: path.clone(),
            source,
        })?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Size-bounded digest of the run: the latest event per stage, in first-
    /// appearance order, plus trailing run-level events. Hard-capped at the
    /// configured char limit; never the raw log.
    pub fn summarize(&self, run_id: Uuid) -> Result<String, StoreError> {
        let events = self.read_events(run_id)?;

        let mut stage_order: Vec<String> = Vec::new();
        let mut latest_per_stage: std::collections::HashMap<String, &EventRecord> =
            std::collections::HashMap::new();
        let mut run_level: Option<&EventRecord> = None;

        for event in &events {
            match &event.stage {
                Some(stage) => {
                    if !latest_per_stage.contains_key(stage) {
                        stage_order.push(stage.clone());
                    }
                    latest_per_stage.insert(stage.clone(), event);
                }
                None => run_level = Some(event),
            }
        }

        let mut digest = String::new();
        for stage in &stage_order {
            if let Some(event) = latest_per_stage.get(stage) {
                digest.push_str(&format!("{stage}: {}\n", event.message));
            }
        }
        if let Some(event) = run_level {
            digest.push_str(&format!("run: {}\n", event.message));
        }

        Ok(truncate_chars(&digest, self.summary_cap_chars))
    }
}

/// Truncate to at most `cap` characters, marking the cut.
fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let mut out: String = text.chars().take(cap.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Working-context accounting for one run.
///
/// Charged only with journal summaries, never by ad hoc string length
/// arithmetic elsewhere. Crossing the limit raises an advisory exactly
/// once; it never fails the run.
#[derive(Debug, Clone)]
pub struct ContextBudget {
    limit_chars: usize,
    used_chars: usize,
    advised: bool,
}

impl ContextBudget {
    pub fn new(limit_chars: usize, used_chars: usize) -> Self {
        Self {
            limit_chars,
            used_chars,
            advised: used_chars > limit_chars,
        }
    }

    /// Charge `chars` against the budget. Returns true exactly once, when
    /// the charge crosses the limit - the caller's cue to emit the
    /// advisory event.
    pub fn charge(&mut self, chars: usize) -> bool {
        self.used_chars += chars;
        if self.used_chars > self.limit_chars && !self.advised {
            self.advised = true;
            return true;
        }
        false
    }

    pub fn used_chars(&self) -> usize {
        self.used_chars
    }

    pub fn usage_percentage(&self) -> f32 {
        if self.limit_chars == 0 {
            return 100.0;
        }
        (self.used_chars as f32 / self.limit_chars as f32) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logger(cap: usize) -> (WorkflowLogger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (WorkflowLogger::new(dir.path().to_path_buf(), cap), dir)
    }

    #[test]
    fn events_append_in_order() {
        let (logger, _dir) = logger(DEFAULT_SUMMARY_CAP_CHARS);
        let run_id = Uuid::new_v4();
        logger
            .log_event(run_id, Some("research"), "attempt 1 started", json!({}))
            .unwrap();
        logger
            .log_event(
                run_id,
                Some("research"),
                "committed",
                json!({"attempt": 1, "duration_ms": 42}),
            )
            .unwrap();

        let events = logger.read_events(run_id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "attempt 1 started");
        assert_eq!(events[1].metadata["duration_ms"], 42);
    }

    #[test]
    fn events_are_partitioned_by_run() {
        let (logger, _dir) = logger(DEFAULT_SUMMARY_CAP_CHARS);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        logger.log_event(a, None, "run a", json!({})).unwrap();
        assert!(logger.read_events(b).unwrap().is_empty());
    }

    #[test]
    fn summarize_keeps_latest_event_per_stage() {
        let (logger, _dir) = logger(DEFAULT_SUMMARY_CAP_CHARS);
        let run_id = Uuid::new_v4();
        logger
            .log_event(run_id, Some("plan"), "attempt 1 failed", json!({}))
            .unwrap();
        logger
            .log_event(run_id, Some("plan"), "committed on attempt 2", json!({}))
            .unwrap();

        let digest = logger.summarize(run_id).unwrap();
        assert!(digest.contains("committed on attempt 2"));
        assert!(!digest.contains("attempt 1 failed"));
    }

    #[test]
    fn summarize_preserves_stage_order() {
        let (logger, _dir) = logger(DEFAULT_SUMMARY_CAP_CHARS);
        let run_id = Uuid::new_v4();
        for stage in ["research", "plan", "write-tests"] {
            logger
                .log_event(run_id, Some(stage), "committed", json!({}))
                .unwrap();
        }
        let digest = logger.summarize(run_id).unwrap();
        let research = digest.find("research:").unwrap();
        let plan = digest.find("plan:").unwrap();
        let tests = digest.find("write-tests:").unwrap();
        assert!(research < plan && plan < tests);
    }

    #[test]
    fn summarize_is_hard_capped() {
        let (logger, _dir) = logger(80);
        let run_id = Uuid::new_v4();
        for i in 0..20 {
            logger
                .log_event(
                    run_id,
                    Some(&format!("stage-{i}")),
                    &"x".repeat(50),
                    json!({}),
                )
                .unwrap();
        }
        let digest = logger.summarize(run_id).unwrap();
        assert!(digest.chars().count() <= 80);
        assert!(digest.ends_with('…'));
    }

    #[test]
    fn torn_tail_line_does_not_poison_the_log() {
        let (logger, dir) = logger(DEFAULT_SUMMARY_CAP_CHARS);
        let run_id = Uuid::new_v4();
        logger.log_event(run_id, None, "intact", json!({})).unwrap();
        let path = dir.path().join(run_id.to_string()).join("events.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        write!(file, "{{\"run_id\": \"{run_id}\", \"mess").unwrap();

        let events = logger.read_events(run_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "intact");
    }

    #[test]
    fn context_budget_advises_exactly_once() {
        let mut budget = ContextBudget::new(100, 0);
        assert!(!budget.charge(60));
        assert!(budget.charge(60), "crossing the limit must advise");
        assert!(!budget.charge(60), "already advised");
        assert_eq!(budget.used_chars(), 180);
    }

    #[test]
    fn context_budget_restored_above_limit_does_not_re_advise() {
        let mut budget = ContextBudget::new(100, 150);
        assert!(!budget.charge(10));
    }

    #[test]
    fn context_budget_usage_percentage() {
        let budget = ContextBudget::new(200, 50);
        assert!((budget.usage_percentage() - 25.0).abs() < 0.01);
    }
}
