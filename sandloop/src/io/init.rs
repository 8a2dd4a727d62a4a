//! Workspace layout under `.sandloop/` and its initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{Config, write_config};

/// Canonical paths within `.sandloop/` for a project root.
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub results_path: PathBuf,
    pub runs_dir: PathBuf,
    pub sandboxes_dir: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let home = root.join(".sandloop");
        Self {
            root: root.clone(),
            home: home.clone(),
            config_path: home.join("config.toml"),
            results_path: home.join("results.jsonl"),
            runs_dir: home.join("runs"),
            sandboxes_dir: home.join("sandboxes"),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn run_record_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    pub fn ledger_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("steps.json")
    }

    pub fn iterations_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("iterations")
    }

    /// Resolve a configured path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Create `.sandloop/` scaffolding in `root` with a default config.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<Paths> {
    let paths = Paths::new(root);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    let config = Config::default();
    for dir in [
        &paths.home,
        &paths.runs_dir,
        &paths.sandboxes_dir,
        &paths.resolve(&config.sandbox.templates_dir),
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    write_config(&paths.config_path, &config)?;

    info!(home = %paths.home.display(), "workspace initialized");
    Ok(paths)
}

/// Validate that an id is safe to use as a directory name.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.len() > 64 {
        return Err(anyhow!("id must be at most 64 characters (got {})", id.len()));
    }
    if id.starts_with('.') {
        return Err(anyhow!("id must not start with '.'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}
