//! Test-only fakes and fixtures for driving runs without real backends.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::core::conversation::{Completion, ToolCallRequest};
use crate::io::config::{Config, write_config};
use crate::io::init::{InitOptions, Paths, init_workspace};
use crate::io::model::{CompletionRequest, Model};
use crate::io::sandbox::{LocalSandboxProvider, SandboxProvider};
use crate::io::store::{ResultRecord, ResultStore};

/// Model replaying a fixed list of completions and recording every request.
///
/// Once the script is exhausted it fails, unless built with [`ScriptedModel::repeating`].
pub struct ScriptedModel {
    script: RefCell<VecDeque<Completion>>,
    repeat: Option<Completion>,
    requests: RefCell<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Completion>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            repeat: None,
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Answer every request with `completion`.
    pub fn repeating(completion: Completion) -> Self {
        Self {
            repeat: Some(completion),
            ..Self::new(Vec::new())
        }
    }

    pub fn text(text: &str) -> Completion {
        Completion {
            text: Some(text.to_string()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Completion {
        Completion {
            text: None,
            tool_calls,
        }
    }

    pub fn invocations(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.borrow().clone()
    }
}

impl Model for ScriptedModel {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(next) = self.script.borrow_mut().pop_front() {
            return Ok(next);
        }
        self.repeat.clone().ok_or_else(|| {
            anyhow!(
                "scripted model exhausted after {} request(s)",
                self.invocations() - 1
            )
        })
    }
}

/// `createOrUpdateFiles` call writing `files`.
pub fn write_files_call(id: &str, files: &[(&str, &str)]) -> ToolCallRequest {
    let files: Vec<_> = files
        .iter()
        .map(|(path, content)| json!({"path": path, "content": content}))
        .collect();
    ToolCallRequest {
        id: id.to_string(),
        name: "createOrUpdateFiles".to_string(),
        arguments: json!({ "files": files }),
    }
}

pub fn terminal_call(id: &str, command: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: "terminal".to_string(),
        arguments: json!({ "command": command }),
    }
}

/// Completion text carrying a completion marker.
pub fn summary_text(summary: &str) -> String {
    format!("All done.\n<task_summary>\n{summary}\n</task_summary>")
}

/// Provider wrapper counting `create` calls, with optional injected failures.
pub struct CountingSandbox<P> {
    inner: P,
    creates: Cell<usize>,
    fail_creates: Cell<u32>,
}

impl<P: SandboxProvider> CountingSandbox<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            creates: Cell::new(0),
            fail_creates: Cell::new(0),
        }
    }

    /// Successful `create` calls so far.
    pub fn creates(&self) -> usize {
        self.creates.get()
    }

    /// Make the next `count` `create` calls fail.
    pub fn fail_next_creates(&self, count: u32) {
        self.fail_creates.set(count);
    }
}

impl<P: SandboxProvider> SandboxProvider for CountingSandbox<P> {
    type Session = P::Session;

    fn create(&self, template: &str) -> Result<String> {
        let pending = self.fail_creates.get();
        if pending > 0 {
            self.fail_creates.set(pending - 1);
            return Err(anyhow!("sandbox service unavailable"));
        }
        let id = self.inner.create(template)?;
        self.creates.set(self.creates.get() + 1);
        Ok(id)
    }

    fn connect(&self, sandbox_id: &str) -> Result<Self::Session> {
        self.inner.connect(sandbox_id)
    }
}

/// In-memory result store.
#[derive(Default)]
pub struct MemoryResultStore {
    records: RefCell<Vec<ResultRecord>>,
    fail_creates: Cell<u32>,
}

impl MemoryResultStore {
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.borrow().clone()
    }

    /// Make the next `count` `create` calls fail.
    pub fn fail_next_creates(&self, count: u32) {
        self.fail_creates.set(count);
    }
}

impl ResultStore for MemoryResultStore {
    fn create(&self, record: &ResultRecord) -> Result<()> {
        let pending = self.fail_creates.get();
        if pending > 0 {
            self.fail_creates.set(pending - 1);
            return Err(anyhow!("result store unavailable"));
        }
        self.records.borrow_mut().push(record.clone());
        Ok(())
    }
}

/// Initialized `.sandloop/` workspace in a temp dir, with retries that never sleep.
pub struct TestWorkspace {
    pub temp: TempDir,
    pub paths: Paths,
    pub config: Config,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let mut config = Config::default();
        config.steps.backoff_base_ms = 0;
        config.steps.backoff_max_ms = 0;
        write_config(&paths.config_path, &config).expect("write config");
        Self {
            temp,
            paths,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn provider(&self) -> CountingSandbox<LocalSandboxProvider> {
        CountingSandbox::new(LocalSandboxProvider::new(&self.paths, &self.config.sandbox))
    }

    /// Number of sandbox directories provisioned in this workspace.
    pub fn sandbox_count(&self) -> usize {
        fs::read_dir(&self.paths.sandboxes_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
