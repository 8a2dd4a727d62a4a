//! Sandbox sessions: one ephemeral execution environment per run.
//!
//! [`SandboxProvider`] creates environments and re-attaches to them by id.
//! Steps never hold a session across a suspension point; each one connects
//! again from the persisted sandbox id. [`LocalSandboxProvider`] backs every
//! sandbox with a directory under `.sandloop/sandboxes/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::config::SandboxConfig;
use super::init::{Paths, validate_id};
use super::process::{Stream, run_command_streaming};
use super::write_json_atomic;

/// Template that needs no directory on disk: an empty working root.
pub const BASE_TEMPLATE: &str = "base";

/// How a shell command ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    pub timed_out: bool,
    /// Transport failure (spawn, I/O) that prevented a normal exit.
    pub error: Option<String>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.timed_out && self.code == Some(0)
    }

    /// Short human-readable reason for a failed command.
    pub fn describe(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        if self.timed_out {
            return "timed out".to_string();
        }
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Result of [`SandboxSession::run_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Captured stdout (bounded by the sandbox's output limit).
    pub stdout: String,
    pub exit: ExitInfo,
}

/// A connected execution environment.
pub trait SandboxSession {
    fn sandbox_id(&self) -> &str;

    /// Run a shell command, streaming output into the callbacks as it arrives.
    ///
    /// Never fails: non-zero exits, timeouts and transport errors are reported
    /// through [`CommandResult::exit`] alongside whatever output was captured.
    fn run_command(
        &self,
        command: &str,
        on_stdout: &mut dyn FnMut(&str),
        on_stderr: &mut dyn FnMut(&str),
    ) -> CommandResult;

    /// Write `content` to `path`, relative to the working root.
    fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Read `path`, relative to the working root.
    fn read_file(&self, path: &str) -> Result<String>;

    /// Externally reachable URL of a service listening on `port`.
    fn resolve_host(&self, port: u16) -> Result<String>;
}

/// Creates environments and re-attaches to them.
pub trait SandboxProvider {
    type Session: SandboxSession;

    /// Provision a new environment from `template`, returning its id.
    fn create(&self, template: &str) -> Result<String>;

    fn connect(&self, sandbox_id: &str) -> Result<Self::Session>;
}

/// Metadata stored in `sandboxes/<id>/sandbox.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMeta {
    pub sandbox_id: String,
    pub template: String,
    pub created_at: DateTime<Utc>,
}

/// Directory-backed sandboxes running commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    sandboxes_dir: PathBuf,
    templates_dir: PathBuf,
    config: SandboxConfig,
}

impl LocalSandboxProvider {
    pub fn new(paths: &Paths, config: &SandboxConfig) -> Self {
        Self {
            sandboxes_dir: paths.sandboxes_dir.clone(),
            templates_dir: paths.resolve(&config.templates_dir),
            config: config.clone(),
        }
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.sandboxes_dir.join(sandbox_id)
    }
}

impl SandboxProvider for LocalSandboxProvider {
    type Session = LocalSandbox;

    #[instrument(skip_all, fields(template = %template))]
    fn create(&self, template: &str) -> Result<String> {
        let source = self.templates_dir.join(template);
        let has_source = source.is_dir();
        if !has_source && template != BASE_TEMPLATE {
            return Err(anyhow!(
                "unknown sandbox template '{template}' (expected directory {})",
                source.display()
            ));
        }

        let sandbox_id = new_sandbox_id();
        let dir = self.sandbox_dir(&sandbox_id);
        let workdir = dir.join("workdir");
        fs::create_dir_all(&workdir)
            .with_context(|| format!("create sandbox workdir {}", workdir.display()))?;
        if has_source {
            copy_tree(&source, &workdir)
                .with_context(|| format!("copy template '{template}' into {sandbox_id}"))?;
        }

        let meta = SandboxMeta {
            sandbox_id: sandbox_id.clone(),
            template: template.to_string(),
            created_at: Utc::now(),
        };
        write_json_atomic(&dir.join("sandbox.json"), &meta)?;

        info!(sandbox_id = %sandbox_id, "sandbox created");
        Ok(sandbox_id)
    }

    fn connect(&self, sandbox_id: &str) -> Result<LocalSandbox> {
        validate_id(sandbox_id).context("invalid sandbox id")?;
        let dir = self.sandbox_dir(sandbox_id);
        let meta_path = dir.join("sandbox.json");
        let contents = fs::read_to_string(&meta_path)
            .with_context(|| format!("sandbox '{sandbox_id}' not found at {}", dir.display()))?;
        let meta: SandboxMeta = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", meta_path.display()))?;
        if meta.sandbox_id != sandbox_id {
            return Err(anyhow!(
                "sandbox metadata {} names '{}', not '{sandbox_id}'",
                meta_path.display(),
                meta.sandbox_id
            ));
        }
        debug!(sandbox_id, "sandbox connected");
        Ok(LocalSandbox {
            sandbox_id: meta.sandbox_id,
            workdir: dir.join("workdir"),
            url_template: self.config.url_template.clone(),
            timeout: Duration::from_secs(self.config.command_timeout_secs),
            output_limit_bytes: self.config.output_limit_bytes,
        })
    }
}

/// Session handle for a [`LocalSandboxProvider`] sandbox.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    sandbox_id: String,
    workdir: PathBuf,
    url_template: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl LocalSandbox {
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

impl SandboxSession for LocalSandbox {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    #[instrument(skip_all, fields(sandbox_id = %self.sandbox_id))]
    fn run_command(
        &self,
        command: &str,
        on_stdout: &mut dyn FnMut(&str),
        on_stderr: &mut dyn FnMut(&str),
    ) -> CommandResult {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .env("SANDLOOP_SANDBOX_ID", &self.sandbox_id);

        let result = run_command_streaming(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            &mut |stream, chunk| match stream {
                Stream::Stdout => on_stdout(chunk),
                Stream::Stderr => on_stderr(chunk),
            },
        );
        match result {
            Ok(output) => CommandResult {
                stdout: output.stdout_lossy(),
                exit: ExitInfo {
                    code: output.status.code(),
                    timed_out: output.timed_out,
                    error: None,
                },
            },
            Err(err) => {
                warn!(err = %err, "sandbox command could not run");
                CommandResult {
                    stdout: String::new(),
                    exit: ExitInfo {
                        code: None,
                        timed_out: false,
                        error: Some(format!("{err:#}")),
                    },
                }
            }
        }
    }

    fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.workdir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&target, content).with_context(|| format!("write {path}"))
    }

    fn read_file(&self, path: &str) -> Result<String> {
        fs::read_to_string(self.workdir.join(path)).with_context(|| format!("read {path}"))
    }

    fn resolve_host(&self, port: u16) -> Result<String> {
        if !self.url_template.contains("{port}") && !self.url_template.contains("{sandbox_id}") {
            return Err(anyhow!(
                "url template '{}' has no {{port}} or {{sandbox_id}} placeholder",
                self.url_template
            ));
        }
        Ok(self
            .url_template
            .replace("{port}", &port.to_string())
            .replace("{sandbox_id}", &self.sandbox_id))
    }
}

fn new_sandbox_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("sbx-{}", &id[..12])
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("strip prefix {}", source.display()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create directory {}", target.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(root: &Path) -> LocalSandboxProvider {
        LocalSandboxProvider::new(&Paths::new(root), &SandboxConfig::default())
    }

    #[test]
    fn base_template_creates_empty_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = provider(temp.path());

        let id = provider.create(BASE_TEMPLATE).expect("create");
        assert!(id.starts_with("sbx-"));
        let session = provider.connect(&id).expect("connect");
        assert_eq!(session.sandbox_id(), id);
        assert_eq!(
            fs::read_dir(session.workdir()).expect("read dir").count(),
            0
        );
    }

    /// Templates are copied recursively into each new sandbox.
    #[test]
    fn named_template_is_copied() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template = temp.path().join(".sandloop/templates/nextjs/app");
        fs::create_dir_all(&template).expect("mkdir");
        fs::write(template.join("page.tsx"), "export default 1").expect("write");

        let provider = provider(temp.path());
        let id = provider.create("nextjs").expect("create");
        let session = provider.connect(&id).expect("connect");
        assert_eq!(
            session.read_file("app/page.tsx").expect("read"),
            "export default 1"
        );
    }

    #[test]
    fn unknown_template_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = provider(temp.path()).create("missing").unwrap_err();
        assert!(err.to_string().contains("unknown sandbox template"));
    }

    #[test]
    fn connect_to_unknown_sandbox_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(provider(temp.path()).connect("sbx-nope").is_err());
        assert!(provider(temp.path()).connect("../escape").is_err());
    }

    #[test]
    fn files_round_trip_through_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = provider(temp.path());
        let session = provider
            .connect(&provider.create(BASE_TEMPLATE).expect("create"))
            .expect("connect");

        session.write_file("src/lib.rs", "fn main() {}").expect("write");
        assert_eq!(session.read_file("src/lib.rs").expect("read"), "fn main() {}");
        assert!(session.read_file("absent.txt").is_err());
    }

    /// Commands run in the working root and stream both pipes.
    #[test]
    fn run_command_streams_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = provider(temp.path());
        let session = provider
            .connect(&provider.create(BASE_TEMPLATE).expect("create"))
            .expect("connect");
        session.write_file("hello.txt", "hi").expect("write");

        let mut out = String::new();
        let mut err = String::new();
        let result = session.run_command(
            "cat hello.txt; echo; echo warn >&2",
            &mut |chunk| out.push_str(chunk),
            &mut |chunk| err.push_str(chunk),
        );
        assert!(result.exit.success());
        assert_eq!(out, "hi\n");
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(err, "warn\n");
    }

    #[test]
    fn failing_command_reports_exit_without_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = provider(temp.path());
        let session = provider
            .connect(&provider.create(BASE_TEMPLATE).expect("create"))
            .expect("connect");

        let result = session.run_command("echo partial; exit 7", &mut |_| {}, &mut |_| {});
        assert!(!result.exit.success());
        assert_eq!(result.exit.code, Some(7));
        assert_eq!(result.exit.describe(), "exit code 7");
        assert_eq!(result.stdout, "partial\n");
    }

    /// Starting a server in the background succeeds once the shell exits.
    #[test]
    fn background_server_command_returns_promptly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = provider(temp.path());
        let session = provider
            .connect(&provider.create(BASE_TEMPLATE).expect("create"))
            .expect("connect");

        let started = std::time::Instant::now();
        let result = session.run_command("sleep 30 & echo started", &mut |_| {}, &mut |_| {});

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(result.exit.success());
        assert!(!result.exit.timed_out);
        assert_eq!(result.stdout, "started\n");
    }

    #[test]
    fn resolve_host_fills_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = provider(temp.path());
        let id = provider.create(BASE_TEMPLATE).expect("create");
        let session = provider.connect(&id).expect("connect");

        assert_eq!(
            session.resolve_host(3000).expect("url"),
            format!("https://3000-{id}.localhost")
        );
    }
}
