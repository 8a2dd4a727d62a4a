//! End-to-end run tests through the public driver API.
//!
//! These tests drive `start_run`/`resume_run` against a real directory-backed
//! sandbox with a scripted model and an in-memory result store, and check the
//! persisted ledger, run record and result.

use std::fs;

use sandloop::core::types::{FileMap, LoopStop, Outcome};
use sandloop::finalize::GENERIC_FAILURE;
use sandloop::io::ledger::{StepLedger, StepStatus};
use sandloop::io::run_record::load_run_record;
use sandloop::io::sandbox::{LocalSandboxProvider, SandboxProvider, SandboxSession};
use sandloop::io::store::RecordKind;
use sandloop::looping::CancelToken;
use sandloop::run::{RunEvent, Runtime, handle_event, resume_run, start_run};
use sandloop::step::RunFailed;
use sandloop::test_support::{
    CountingSandbox, MemoryResultStore, ScriptedModel, TestWorkspace, summary_text,
    terminal_call, write_files_call,
};

fn runtime<'a>(
    ws: &'a TestWorkspace,
    model: &'a ScriptedModel,
    sandbox: &'a CountingSandbox<LocalSandboxProvider>,
    store: &'a MemoryResultStore,
    cancel: &'a CancelToken,
) -> Runtime<'a, ScriptedModel, CountingSandbox<LocalSandboxProvider>, MemoryResultStore> {
    Runtime {
        paths: &ws.paths,
        config: &ws.config,
        model,
        sandbox,
        store,
        cancel,
    }
}

/// "Create hello.txt with 'hi'": one write call, then a summary, then success.
#[test]
fn hello_file_scenario_succeeds() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::new(vec![
        ScriptedModel::calls(vec![write_files_call("c1", &[("hello.txt", "hi")])]),
        ScriptedModel::text(&summary_text("Created hello.txt containing 'hi'.")),
    ]);
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let event = RunEvent::new("Create a file named hello.txt with content 'hi'");
    let result = handle_event(&rt, &event, Some("run-hello")).expect("run");

    assert_eq!(result.outcome, Outcome::Success);
    let expected = FileMap::from([("hello.txt".to_string(), "hi".to_string())]);
    assert_eq!(result.files, expected);
    assert_eq!(
        result.summary.as_deref(),
        Some("Created hello.txt containing 'hi'.")
    );
    assert_eq!(result.title, "Fragment");
    assert_eq!(model.invocations(), 2);

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, RecordKind::Result);
    let fragment = records[0].fragment.as_ref().expect("fragment");
    assert_eq!(fragment.files, expected);
    assert_eq!(fragment.sandbox_url, result.url);

    let record = load_run_record(&ws.paths.run_record_path("run-hello")).expect("record");
    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.stop, Some(LoopStop::Completed));
    assert_eq!(record.iterations, 2);
    assert!(ws.paths.iterations_dir("run-hello").join("1/turn.json").is_file());
    assert!(ws.paths.iterations_dir("run-hello").join("2/turn.json").is_file());

    let session = sandbox
        .connect(record.sandbox_id.as_deref().expect("sandbox id"))
        .expect("connect");
    assert_eq!(session.read_file("hello.txt").expect("read"), "hi");
}

/// A run that never reports completion stops at the bound and is an error.
#[test]
fn iteration_limit_yields_generic_error() {
    let mut ws = TestWorkspace::new();
    ws.config.max_iterations = 4;
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::repeating(ScriptedModel::text("thinking about it"));
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let result = start_run(&rt, "build a counter", Some("run-bound")).expect("run");

    assert_eq!(result.outcome, Outcome::Error);
    assert_eq!(model.invocations(), 4);
    assert!(result.summary.is_none());
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, GENERIC_FAILURE);
    assert!(records[0].fragment.is_none());

    let record = load_run_record(&ws.paths.run_record_path("run-bound")).expect("record");
    assert_eq!(
        record.stop,
        Some(LoopStop::IterationLimit { max_iterations: 4 })
    );
}

/// Only the first marker counts; the model is not asked again after it.
#[test]
fn first_summary_wins() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::new(vec![
        ScriptedModel::calls(vec![write_files_call("c1", &[("a.txt", "x")])]),
        ScriptedModel::text(&summary_text("first")),
        ScriptedModel::text(&summary_text("second")),
    ]);
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let result = start_run(&rt, "task", None).expect("run");

    assert_eq!(result.summary.as_deref(), Some("first"));
    assert_eq!(model.invocations(), 2);
}

/// A summary without any written file is still classified as an error.
#[test]
fn summary_without_files_is_error() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::new(vec![ScriptedModel::text(&summary_text("nothing to do"))]);
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let result = start_run(&rt, "task", None).expect("run");

    assert_eq!(result.outcome, Outcome::Error);
    assert_eq!(result.summary.as_deref(), Some("nothing to do"));
    assert_eq!(store.records()[0].content, GENERIC_FAILURE);
}

/// A failing command is fed back to the agent and the run carries on.
#[test]
fn failing_terminal_is_contained() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::new(vec![
        ScriptedModel::calls(vec![terminal_call(
            "t1",
            "echo compiling; echo 'module not found' >&2; exit 2",
        )]),
        ScriptedModel::calls(vec![write_files_call("c1", &[("fix.txt", "fixed")])]),
        ScriptedModel::text(&summary_text("Recovered from the failed build.")),
    ]);
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let result = start_run(&rt, "task", None).expect("run");

    assert_eq!(result.outcome, Outcome::Success);
    let second = &model.requests()[1];
    let fed_back = serde_json::to_string(&second.messages).expect("json");
    assert!(fed_back.contains("Command failed"));
    assert!(fed_back.contains("module not found"));
    assert!(fed_back.contains("exit 2"));
}

/// A failed agent step aborts the run; resuming replays everything already
/// recorded, reuses the same sandbox, and only asks the model for new turns.
#[test]
fn resume_after_failure_reuses_sandbox_and_turns() {
    let mut ws = TestWorkspace::new();
    ws.config.steps.max_attempts = 2;
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();

    let first_model = ScriptedModel::new(vec![ScriptedModel::calls(vec![write_files_call(
        "c1",
        &[("hello.txt", "hi")],
    )])]);
    let rt = runtime(&ws, &first_model, &sandbox, &store, &cancel);
    let err = start_run(&rt, "task", Some("run-crash")).unwrap_err();
    let failed = err.downcast_ref::<RunFailed>().expect("RunFailed");
    assert_eq!(failed.step, "iter-2/agent");
    assert_eq!(failed.attempts, 2);
    assert!(store.records().is_empty());

    let record = load_run_record(&ws.paths.run_record_path("run-crash")).expect("record");
    assert!(record.failure.is_some());
    assert_eq!(record.outcome, Outcome::Pending);

    // Without re-arming, the recorded failure is reproduced as is.
    let idle_model = ScriptedModel::new(Vec::new());
    let rt = runtime(&ws, &idle_model, &sandbox, &store, &cancel);
    let err = resume_run(&rt, "run-crash", false).unwrap_err();
    assert!(err.downcast_ref::<RunFailed>().is_some());
    assert_eq!(idle_model.invocations(), 0);

    let second_model = ScriptedModel::new(vec![ScriptedModel::text(&summary_text("done"))]);
    let rt = runtime(&ws, &second_model, &sandbox, &store, &cancel);
    let result = resume_run(&rt, "run-crash", true).expect("resume");

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(second_model.invocations(), 1);
    assert_eq!(sandbox.creates(), 1);
    assert_eq!(ws.sandbox_count(), 1);
    assert_eq!(
        result.files.get("hello.txt").map(String::as_str),
        Some("hi")
    );

    let record = load_run_record(&ws.paths.run_record_path("run-crash")).expect("record");
    assert!(record.failure.is_none());
    assert_eq!(record.outcome, Outcome::Success);
}

/// Re-driving a finished run repeats nothing: no new sandbox, model call or result.
#[test]
fn completed_run_is_idempotent() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::new(vec![
        ScriptedModel::calls(vec![write_files_call("c1", &[("a.txt", "x")])]),
        ScriptedModel::text(&summary_text("done")),
    ]);
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);
    let first = start_run(&rt, "task", Some("run-idem")).expect("first");

    let idle_model = ScriptedModel::new(Vec::new());
    let rt = runtime(&ws, &idle_model, &sandbox, &store, &cancel);
    let again = start_run(&rt, "task", Some("run-idem")).expect("again");

    assert_eq!(again, first);
    assert_eq!(idle_model.invocations(), 0);
    assert_eq!(sandbox.creates(), 1);
    assert_eq!(store.records().len(), 1);
}

#[test]
fn reusing_run_id_with_other_task_is_rejected() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::repeating(ScriptedModel::text(&summary_text("done")));
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    start_run(&rt, "first task", Some("run-dup")).expect("first");
    let err = start_run(&rt, "second task", Some("run-dup")).unwrap_err();
    assert!(err.to_string().contains("different task"));
}

/// Sandbox creation is retried with durable backoff sleeps before succeeding.
#[test]
fn transient_sandbox_failure_is_retried() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    sandbox.fail_next_creates(2);
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::new(vec![
        ScriptedModel::calls(vec![write_files_call("c1", &[("a.txt", "x")])]),
        ScriptedModel::text(&summary_text("done")),
    ]);
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let result = start_run(&rt, "task", Some("run-retry")).expect("run");
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(sandbox.creates(), 1);

    let ledger =
        StepLedger::open("run-retry", &ws.paths.ledger_path("run-retry")).expect("ledger");
    let record = ledger.get("get-sandbox-id").expect("step");
    assert_eq!(record.attempts, 3);
    assert!(matches!(
        ledger.get("get-sandbox-id/backoff-1").expect("sleep").status,
        StepStatus::Sleeping { .. }
    ));
    assert!(ledger.get("get-sandbox-id/backoff-2").is_some());
}

/// Exhausted sandbox creation fails the run before any agent step.
#[test]
fn exhausted_sandbox_creation_fails_run() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    sandbox.fail_next_creates(10);
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::repeating(ScriptedModel::text("unused"));
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let err = start_run(&rt, "task", Some("run-nosbx")).unwrap_err();
    let failed = err.downcast_ref::<RunFailed>().expect("RunFailed");
    assert_eq!(failed.step, "get-sandbox-id");
    assert_eq!(model.invocations(), 0);
    assert!(store.records().is_empty());
}

/// A cancelled run skips the agent but is still finalized.
#[test]
fn cancelled_run_is_finalized_as_error() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    cancel.cancel();
    let model = ScriptedModel::repeating(ScriptedModel::text("unused"));
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);

    let result = start_run(&rt, "task", Some("run-cancel")).expect("run");

    assert_eq!(result.outcome, Outcome::Error);
    assert_eq!(model.invocations(), 0);
    let record = load_run_record(&ws.paths.run_record_path("run-cancel")).expect("record");
    assert_eq!(record.stop, Some(LoopStop::Cancelled));
    assert_eq!(store.records().len(), 1);
}

/// Re-driving a cancelled run returns the persisted result without new turns.
#[test]
fn cancelled_run_stays_cancelled_when_redriven() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancelled = CancelToken::new();
    cancelled.cancel();
    let unused = ScriptedModel::new(Vec::new());
    let first = start_run(
        &runtime(&ws, &unused, &sandbox, &store, &cancelled),
        "task",
        Some("run-recancel"),
    )
    .expect("first run");

    let fresh = CancelToken::new();
    let model = ScriptedModel::new(vec![
        ScriptedModel::calls(vec![write_files_call("c1", &[("a.txt", "x")])]),
        ScriptedModel::text(&summary_text("done")),
    ]);
    let rt = runtime(&ws, &model, &sandbox, &store, &fresh);
    let again = start_run(&rt, "task", Some("run-recancel")).expect("second run");
    let resumed = resume_run(&rt, "run-recancel", false).expect("resume");

    assert_eq!(model.invocations(), 0);
    assert_eq!(first.outcome, Outcome::Error);
    assert_eq!(again, first);
    assert_eq!(resumed, first);
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, RecordKind::Error);
    assert_eq!(records[0].content, GENERIC_FAILURE);
    let record = load_run_record(&ws.paths.run_record_path("run-recancel")).expect("record");
    assert_eq!(record.outcome, Outcome::Error);
    assert_eq!(record.stop, Some(LoopStop::Cancelled));
}

/// Raising `max_iterations` does not reopen a run that hit the old bound.
#[test]
fn iteration_limited_run_stays_finished_under_raised_bound() {
    let mut ws = TestWorkspace::new();
    ws.config.max_iterations = 2;
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::repeating(ScriptedModel::text("still working"));
    let first = start_run(
        &runtime(&ws, &model, &sandbox, &store, &cancel),
        "task",
        Some("run-bound"),
    )
    .expect("first run");
    assert_eq!(model.invocations(), 2);

    ws.config.max_iterations = 10;
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);
    let again = resume_run(&rt, "run-bound", false).expect("resume");

    assert_eq!(model.invocations(), 2);
    assert_eq!(again, first);
    assert_eq!(store.records().len(), 1);
    let record = load_run_record(&ws.paths.run_record_path("run-bound")).expect("record");
    assert_eq!(record.stop, Some(LoopStop::IterationLimit { max_iterations: 2 }));
}

#[test]
fn ledger_is_persisted_as_json() {
    let ws = TestWorkspace::new();
    let sandbox = ws.provider();
    let store = MemoryResultStore::default();
    let cancel = CancelToken::new();
    let model = ScriptedModel::new(vec![
        ScriptedModel::calls(vec![write_files_call("c1", &[("a.txt", "x")])]),
        ScriptedModel::text(&summary_text("done")),
    ]);
    let rt = runtime(&ws, &model, &sandbox, &store, &cancel);
    start_run(&rt, "task", Some("run-ledger")).expect("run");

    let raw = fs::read_to_string(ws.paths.ledger_path("run-ledger")).expect("read");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let names: Vec<&str> = value["steps"]
        .as_array()
        .expect("steps")
        .iter()
        .map(|step| step["name"].as_str().expect("name"))
        .collect();
    assert_eq!(
        names,
        vec![
            "get-sandbox-id",
            "iter-1/agent",
            "iter-1/call-1/createOrUpdateFiles",
            "iter-2/agent",
            "loop-stop",
            "get-sandbox-url",
            "save-result",
        ]
    );
}
