//! `sandloop` command-line interface.
//!
//! Drives coding-agent runs in a `.sandloop/` workspace: each run provisions a
//! sandbox, loops a tool-calling model against it, and records one result.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use sandloop::core::types::Outcome;
use sandloop::exit_codes;
use sandloop::finalize::RunResult;
use sandloop::io::config::load_config;
use sandloop::io::init::{InitOptions, Paths, init_workspace, validate_id};
use sandloop::io::ledger::{StepLedger, StepStatus};
use sandloop::io::model::CommandModel;
use sandloop::io::run_record::load_run_record;
use sandloop::io::sandbox::LocalSandboxProvider;
use sandloop::io::store::JsonlResultStore;
use sandloop::logging;
use sandloop::looping::CancelToken;
use sandloop::run::{Runtime, handle_event, parse_event, resume_run, start_run};
use sandloop::step::RunFailed;

type CliRuntime<'a> = Runtime<'a, CommandModel, LocalSandboxProvider, JsonlResultStore>;

#[derive(Parser)]
#[command(
    name = "sandloop",
    version,
    about = "Durable coding-agent loop against an ephemeral sandbox"
)]
struct Cli {
    /// Project root containing `.sandloop/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.sandloop/` scaffolding and a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the agent on a task.
    Run {
        task: String,
        /// Stable id for the run; an existing run with the same task is continued.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Handle a trigger event read from a JSON file.
    Trigger {
        event: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Re-drive an existing run from its step ledger.
    Resume {
        run_id: String,
        /// Re-arm steps that exhausted their retries.
        #[arg(long)]
        retry_failed: bool,
    },
    /// Print a run record and its recorded steps.
    Show { run_id: String },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<RunFailed>().is_some() {
                exit_codes::RUN_FAILED
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => {
            let paths = init_workspace(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.home.display());
            Ok(exit_codes::OK)
        }
        Command::Run { task, run_id } => with_runtime(&cli.root, |rt| {
            report(start_run(rt, &task, run_id.as_deref())?)
        }),
        Command::Trigger { event, run_id } => {
            let raw = fs::read_to_string(&event)
                .with_context(|| format!("read event {}", event.display()))?;
            let event = parse_event(&raw)?;
            with_runtime(&cli.root, |rt| {
                report(handle_event(rt, &event, run_id.as_deref())?)
            })
        }
        Command::Resume {
            run_id,
            retry_failed,
        } => with_runtime(&cli.root, |rt| {
            report(resume_run(rt, &run_id, retry_failed)?)
        }),
        Command::Show { run_id } => cmd_show(&cli.root, &run_id),
    }
}

fn with_runtime(root: &Path, f: impl FnOnce(&CliRuntime<'_>) -> Result<i32>) -> Result<i32> {
    let paths = Paths::new(root);
    if !paths.home.is_dir() {
        return Err(anyhow!(
            "{} not found (run `sandloop init` first)",
            paths.home.display()
        ));
    }
    let config = load_config(&paths.config_path)?;
    let model = CommandModel::new(&config.model, &paths.root)?;
    let sandbox = LocalSandboxProvider::new(&paths, &config.sandbox);
    let store = JsonlResultStore::new(&paths.results_path);
    let cancel = CancelToken::new();
    let rt = Runtime {
        paths: &paths,
        config: &config,
        model: &model,
        sandbox: &sandbox,
        store: &store,
        cancel: &cancel,
    };
    f(&rt)
}

fn report(result: RunResult) -> Result<i32> {
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("serialize run result")?
    );
    Ok(match result.outcome {
        Outcome::Success => exit_codes::OK,
        Outcome::Error | Outcome::Pending => exit_codes::RUN_ERROR,
    })
}

fn cmd_show(root: &Path, run_id: &str) -> Result<i32> {
    validate_id(run_id).context("invalid run id")?;
    let paths = Paths::new(root);
    let record_path = paths.run_record_path(run_id);
    if !record_path.exists() {
        return Err(anyhow!("run '{run_id}' not found"));
    }
    let record = load_run_record(&record_path)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("serialize run record")?
    );

    let ledger = StepLedger::open(run_id, &paths.ledger_path(run_id))?;
    println!("steps:");
    for step in ledger.records() {
        let status = match &step.status {
            StepStatus::Completed { .. } => "completed".to_string(),
            StepStatus::Failed { error } => format!("failed: {error}"),
            StepStatus::Sleeping { wake_at } => format!("sleep until {}", wake_at.to_rfc3339()),
        };
        println!("  {} [{} attempt(s)] {status}", step.name, step.attempts);
    }
    Ok(exit_codes::OK)
}
