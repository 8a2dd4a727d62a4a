//! `createOrUpdateFiles` and `readFiles`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ToolContext, parse_args};
use crate::core::path::validate_relative_path;
use crate::core::types::{FileEntry, FileMap};
use crate::io::sandbox::{SandboxProvider, SandboxSession};

pub(super) const WRITE_NAME: &str = "createOrUpdateFiles";
pub(super) const WRITE_DESCRIPTION: &str =
    "Create or update files in the sandbox. Paths are relative to the working root.";
pub(super) const WRITE_SCHEMA: &str =
    include_str!("../../schemas/tools/create_or_update_files.schema.json");

pub(super) const READ_NAME: &str = "readFiles";
pub(super) const READ_DESCRIPTION: &str =
    "Read files from the sandbox. Paths are relative to the working root.";
pub(super) const READ_SCHEMA: &str = include_str!("../../schemas/tools/read_files.schema.json");

#[derive(Debug, Deserialize)]
struct WriteArgs {
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    files: Vec<String>,
}

/// Recorded result of a write step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Every file was written; these entries are merged into the run state.
    Written { files: FileMap },
    Failed { error: String },
}

/// Recorded result of a read step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadOutcome {
    Read { files: Vec<FileEntry> },
    Failed { error: String },
}

pub(super) fn handle_write<P: SandboxProvider>(
    args: &Value,
    ctx: &mut ToolContext<'_, P>,
) -> Result<String> {
    let args: WriteArgs = match parse_args(WRITE_NAME, args) {
        Ok(args) => args,
        Err(message) => return Ok(message),
    };
    if let Err(message) = check_paths(args.files.iter().map(|file| file.path.as_str())) {
        return Ok(message);
    }

    let step = ctx.step_name(WRITE_NAME);
    let sandbox = ctx.sandbox;
    let sandbox_id = ctx.sandbox_id;
    let outcome = ctx
        .steps
        .run(&step, || Ok(write_files(sandbox, sandbox_id, &args.files)))?;

    // Applied after the step so replays rebuild the same state.
    match outcome {
        WriteOutcome::Written { files } => {
            debug!(written = files.len(), "merging written files into run state");
            ctx.state.merge_files(files);
            serde_json::to_string(&ctx.state.files).context("serialize file map")
        }
        WriteOutcome::Failed { error } => Ok(format!("Error: {error}")),
    }
}

pub(super) fn handle_read<P: SandboxProvider>(
    args: &Value,
    ctx: &mut ToolContext<'_, P>,
) -> Result<String> {
    let args: ReadArgs = match parse_args(READ_NAME, args) {
        Ok(args) => args,
        Err(message) => return Ok(message),
    };
    if let Err(message) = check_paths(args.files.iter().map(String::as_str)) {
        return Ok(message);
    }

    let step = ctx.step_name(READ_NAME);
    let sandbox = ctx.sandbox;
    let sandbox_id = ctx.sandbox_id;
    let outcome = ctx
        .steps
        .run(&step, || Ok(read_files(sandbox, sandbox_id, &args.files)))?;

    match outcome {
        ReadOutcome::Read { files } => serde_json::to_string(&files).context("serialize files"),
        ReadOutcome::Failed { error } => Ok(format!("Error: {error}")),
    }
}

fn check_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Result<(), String> {
    for path in paths {
        validate_relative_path(path).map_err(|reason| format!("Error: {reason}"))?;
    }
    Ok(())
}

fn write_files<P: SandboxProvider>(
    sandbox: &P,
    sandbox_id: &str,
    files: &[FileEntry],
) -> WriteOutcome {
    let result = sandbox.connect(sandbox_id).and_then(|session| {
        let mut written = FileMap::new();
        for file in files {
            session.write_file(&file.path, &file.content)?;
            written.insert(file.path.clone(), file.content.clone());
        }
        Ok(written)
    });
    match result {
        Ok(files) => WriteOutcome::Written { files },
        Err(err) => WriteOutcome::Failed {
            error: format!("{err:#}"),
        },
    }
}

fn read_files<P: SandboxProvider>(sandbox: &P, sandbox_id: &str, paths: &[String]) -> ReadOutcome {
    let result = sandbox.connect(sandbox_id).and_then(|session| {
        paths
            .iter()
            .map(|path| {
                Ok(FileEntry {
                    path: path.clone(),
                    content: session.read_file(path)?,
                })
            })
            .collect::<Result<Vec<_>>>()
    });
    match result {
        Ok(files) => ReadOutcome::Read { files },
        Err(err) => ReadOutcome::Failed {
            error: format!("{err:#}"),
        },
    }
}
