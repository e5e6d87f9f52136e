//! Runtime configuration.
//!
//! Configuration layers, later wins: built-in defaults, then
//! `.conductor/conductor.toml`, then environment variables, then CLI flags
//! (applied by the binary). The file format:
//!
//! ```toml
//! [project]
//! spec_file = "docs/project-spec.md"
//! capability_cmd = "claude"
//! capability_args = ["-p", "--output-format", "json"]
//!
//! [defaults]
//! max_retries = 2
//! stage_timeout_secs = 600
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! jitter = true
//! context_limit_chars = 240000
//! summary_cap_chars = 1200
//!
//! [stages.overrides."security-check"]
//! max_retries = 0
//! timeout_secs = 300
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::journal::{DEFAULT_CONTEXT_LIMIT_CHARS, DEFAULT_SUMMARY_CAP_CHARS};
use crate::retry::RetryPolicy;
use crate::stage::{self, Stage, DEFAULT_MAX_RETRIES, DEFAULT_STAGE_TIMEOUT_SECS};

pub const DATA_DIR_NAME: &str = ".conductor";
pub const CONFIG_FILE_NAME: &str = "conductor.toml";

/// Engine-wide defaults, overridable per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub max_retries: u32,
    pub stage_timeout_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub context_limit_chars: usize,
    pub summary_cap_chars: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
            context_limit_chars: DEFAULT_CONTEXT_LIMIT_CHARS,
            summary_cap_chars: DEFAULT_SUMMARY_CAP_CHARS,
        }
    }
}

/// Per-stage override block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub retry_on_schema_mismatch: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProjectSection {
    spec_file: Option<PathBuf>,
    capability_cmd: Option<String>,
    capability_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StagesSection {
    overrides: HashMap<String, StageOverride>,
}

/// On-disk representation of `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    project: ProjectSection,
    defaults: Defaults,
    stages: StagesSection,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub log_dir: PathBuf,
    pub spec_file: PathBuf,
    pub capability_cmd: String,
    pub capability_args: Vec<String>,
    pub defaults: Defaults,
    stage_overrides: HashMap<String, StageOverride>,
}

impl Config {
    /// Resolve configuration for `project_dir`, reading
    /// `.conductor/conductor.toml` when present and applying environment
    /// overrides.
    pub fn load(project_dir: PathBuf) -> Result<Self> {
        let data_dir = project_dir.join(DATA_DIR_NAME);
        let config_path = data_dir.join(CONFIG_FILE_NAME);

        let file: ConfigFile = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", config_path.display()))?
        } else {
            ConfigFile::default()
        };

        let spec_file = file
            .project
            .spec_file
            .map(|p| {
                if p.is_absolute() {
                    p
                } else {
                    project_dir.join(p)
                }
            })
            .unwrap_or_else(|| project_dir.join("docs").join("project-spec.md"));

        let capability_cmd = std::env::var("CONDUCTOR_CAPABILITY_CMD")
            .ok()
            .or(file.project.capability_cmd)
            .unwrap_or_else(|| "claude".to_string());

        Ok(Self {
            runs_dir: data_dir.join("runs"),
            log_dir: data_dir.join("logs"),
            project_dir,
            data_dir,
            spec_file,
            capability_cmd,
            capability_args: file.project.capability_args.unwrap_or_default(),
            defaults: file.defaults,
            stage_overrides: file.stages.overrides,
        })
    }

    /// Create the data directories this config points at.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir)
            .with_context(|| format!("failed to create {}", self.runs_dir.display()))?;
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        Ok(())
    }

    /// The pipeline's stage templates with defaults and per-stage
    /// overrides applied.
    pub fn stages(&self) -> Vec<Stage> {
        stage::default_stages()
            .into_iter()
            .map(|mut stage| {
                stage.max_retries = self.defaults.max_retries;
                stage.timeout_secs = self.defaults.stage_timeout_secs;
                if let Some(ov) = self.stage_overrides.get(&stage.name) {
                    if let Some(retries) = ov.max_retries {
                        stage.max_retries = retries;
                    }
                    if let Some(timeout) = ov.timeout_secs {
                        stage.timeout_secs = timeout;
                    }
                    if let Some(retry_mismatch) = ov.retry_on_schema_mismatch {
                        stage.retry_on_schema_mismatch = retry_mismatch;
                    }
                }
                stage
            })
            .collect()
    }

    /// Backoff policy for `stage`: global delay shape, per-stage budget.
    pub fn retry_policy_for(&self, stage: &Stage) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(stage.max_retries)
            .with_base_delay_ms(self.defaults.base_delay_ms)
            .with_max_delay_ms(self.defaults.max_delay_ms)
            .with_jitter(self.defaults.jitter)
    }

    /// Write a starter `conductor.toml` if none exists. Returns whether a
    /// file was written.
    pub fn write_starter_config(&self) -> Result<bool> {
        let path = self.data_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.data_dir)?;
        let starter = ConfigFile {
            project: ProjectSection {
                spec_file: Some(PathBuf::from("docs/project-spec.md")),
                capability_cmd: Some("claude".to_string()),
                capability_args: Some(vec![
                    "-p".into(),
                    "--output-format".into(),
                    "json".into(),
                ]),
            },
            defaults: Defaults::default(),
            stages: StagesSection::default(),
        };
        let content = toml::to_string_pretty(&starter).context("failed to render starter config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(true)
    }
}

/// Resolve the project directory: explicit flag, else the current dir.
pub fn resolve_project_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match flag {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("failed to resolve project directory {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_config(dir: &Path, content: &str) {
        let data_dir = dir.join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join(CONFIG_FILE_NAME), content).unwrap();
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.capability_cmd, "claude");
        assert_eq!(config.defaults.max_retries, DEFAULT_MAX_RETRIES);
        assert!(config.spec_file.ends_with("docs/project-spec.md"));
        assert!(config.runs_dir.ends_with(".conductor/runs"));
    }

    #[test]
    fn file_settings_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[project]
spec_file = "SPEC.md"
capability_cmd = "my-agent"

[defaults]
max_retries = 5
stage_timeout_secs = 120
"#,
        );
        let config = Config::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.capability_cmd, "my-agent");
        assert_eq!(config.defaults.max_retries, 5);
        assert!(config.spec_file.ends_with("SPEC.md"));

        let stages = config.stages();
        assert!(stages.iter().all(|s| s.max_retries == 5));
        assert!(stages.iter().all(|s| s.timeout_secs == 120));
    }

    #[test]
    fn per_stage_overrides_beat_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[stages.overrides."security-check"]
max_retries = 0
timeout_secs = 60
retry_on_schema_mismatch = true
"#,
        );
        let config = Config::load(dir.path().to_path_buf()).unwrap();
        let stages = config.stages();
        let security = stages.iter().find(|s| s.name == "security-check").unwrap();
        assert_eq!(security.max_retries, 0);
        assert_eq!(security.timeout_secs, 60);
        assert!(security.retry_on_schema_mismatch);

        let plan = stages.iter().find(|s| s.name == "plan").unwrap();
        assert_eq!(plan.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!plan.retry_on_schema_mismatch);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[defaults\nmax_retries = ");
        assert!(Config::load(dir.path().to_path_buf()).is_err());
    }

    #[test]
    fn retry_policy_uses_stage_budget_and_global_shape() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[defaults]
base_delay_ms = 50
jitter = false

[stages.overrides."implement"]
max_retries = 7
"#,
        );
        let config = Config::load(dir.path().to_path_buf()).unwrap();
        let stages = config.stages();
        let implement = stages.iter().find(|s| s.name == "implement").unwrap();
        let policy = config.retry_policy_for(implement);
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_delay_ms, 50);
        assert!(!policy.jitter);
    }

    #[test]
    fn starter_config_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf()).unwrap();
        assert!(config.write_starter_config().unwrap());
        assert!(!config.write_starter_config().unwrap());
        // And it parses back.
        assert!(Config::load(dir.path().to_path_buf()).is_ok());
    }
}
