//! Process-backed capability: one external CLI call per stage.
//!
//! The configured command (default: `claude`) is spawned once per
//! invocation with the structured input as JSON on stdin. The process is
//! expected to print a JSON object as the last JSON-parseable line of its
//! stdout; everything before it (streamed commentary, tool chatter) is
//! ignored. Input and raw output are persisted to the log directory for
//! audit.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::alignment::AlignmentCapability;
use crate::invoker::{StageCapability, StageInput};
use crate::specdoc::ProjectSpec;

pub struct ProcessCapability {
    command: String,
    args: Vec<String>,
    log_dir: PathBuf,
}

impl ProcessCapability {
    pub fn new(command: &str, args: Vec<String>, log_dir: PathBuf) -> Self {
        Self {
            command: command.to_string(),
            args,
            log_dir,
        }
    }

    async fn run(
        &self,
        label: &str,
        run_id: Uuid,
        input_json: String,
    ) -> anyhow::Result<serde_json::Value> {
        std::fs::create_dir_all(&self.log_dir)?;
        let input_file = self.log_dir.join(format!("{run_id}-{label}-input.json"));
        std::fs::write(&input_file, &input_json)?;

        tracing::info!(command = %self.command, label, %run_id, "spawning capability process");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn '{}': {e}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input_json.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        let output_file = self.log_dir.join(format!("{run_id}-{label}-output.log"));
        std::fs::write(&output_file, &stdout)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "'{}' exited with {:?}: {}",
                self.command,
                output.status.code(),
                stderr.trim()
            );
        }

        extract_json_object(&stdout).ok_or_else(|| {
            anyhow::anyhow!(
                "'{}' produced no JSON object on stdout (see {})",
                self.command,
                output_file.display()
            )
        })
    }
}

/// Last JSON object in the output: scan lines bottom-up, then fall back to
/// parsing the whole text.
fn extract_json_object(stdout: &str) -> Option<serde_json::Value> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
            return Some(value);
        }
    }
    match serde_json::from_str(stdout.trim()) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}

#[async_trait]
impl StageCapability for ProcessCapability {
    async fn execute(&self, stage: &str, input: &StageInput) -> anyhow::Result<serde_json::Value> {
        let payload = serde_json::to_string_pretty(&serde_json::json!({
            "task": "stage",
            "stage": stage,
            "input": input,
        }))?;
        self.run(stage, input.run_id, payload).await
    }
}

#[async_trait]
impl AlignmentCapability for ProcessCapability {
    async fn assess(
        &self,
        request: &str,
        spec: &ProjectSpec,
    ) -> anyhow::Result<serde_json::Value> {
        let payload = serde_json::to_string_pretty(&serde_json::json!({
            "task": "alignment",
            "request": request,
            "spec": spec,
        }))?;
        // Alignment runs before a run id is meaningful to the capability;
        // the log files still need a unique name.
        self.run("alignment", Uuid::new_v4(), payload).await
    }
}
