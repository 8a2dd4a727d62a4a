//! Loop configuration stored under `.sandloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::write_atomic;

/// Top-level configuration (TOML).
///
/// Missing fields fall back to defaults so a partial file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Maximum agent invocations per run.
    pub max_iterations: u32,

    /// Sandbox template used when provisioning a run's environment.
    pub sandbox_template: String,

    /// Port of the preview service exposed by the sandbox.
    pub preview_port: u16,

    /// Title stored on the fragment of a successful run.
    pub fragment_title: String,

    pub steps: StepsConfig,
    pub sandbox: SandboxConfig,
    pub model: ModelConfig,
}

/// Retry policy for failing steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepsConfig {
    /// Attempts per step before the run fails (including the first one).
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory holding template directories, relative to the project root.
    pub templates_dir: PathBuf,

    /// Preview URL pattern. `{port}` and `{sandbox_id}` are substituted.
    pub url_template: String,

    /// Wall-clock limit for a single shell command.
    pub command_timeout_secs: u64,

    /// Bytes of stdout/stderr kept per command.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command speaking the completion protocol on stdin/stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            sandbox_template: "base".to_string(),
            preview_port: 3000,
            fragment_title: "Fragment".to_string(),
            steps: StepsConfig::default(),
            sandbox: SandboxConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for StepsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from(".sandloop/templates"),
            url_template: "https://{port}-{sandbox_id}.localhost".to_string(),
            command_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["sandloop-model".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl StepsConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.sandbox_template.trim().is_empty() {
            return Err(anyhow!("sandbox_template must not be empty"));
        }
        if self.fragment_title.trim().is_empty() {
            return Err(anyhow!("fragment_title must not be empty"));
        }
        if self.steps.max_attempts == 0 {
            return Err(anyhow!("steps.max_attempts must be > 0"));
        }
        if self.steps.backoff_base_ms > self.steps.backoff_max_ms {
            return Err(anyhow!(
                "steps.backoff_base_ms must not exceed steps.backoff_max_ms"
            ));
        }
        if self.sandbox.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox.command_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.output_limit_bytes == 0 {
            return Err(anyhow!("model.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
