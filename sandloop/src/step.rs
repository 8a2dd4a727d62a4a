//! Durable step execution on top of the [`StepLedger`].
//!
//! Every side-effecting unit of a run goes through [`StepRunner::run`]: a
//! completed step is replayed from the ledger instead of running its body
//! again, so re-driving a run after a crash repeats no side effects.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::core::backoff::backoff_delay;
use crate::io::config::StepsConfig;
use crate::io::ledger::{StepLedger, StepRecord, StepStatus};

/// How often a failing step body is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&StepsConfig> for RetryPolicy {
    fn from(config: &StepsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

/// A step exhausted its retries; the run cannot continue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("run '{run_id}' failed at step '{step}' after {attempts} attempt(s): {message}")]
pub struct RunFailed {
    pub run_id: String,
    pub step: String,
    pub attempts: u32,
    pub message: String,
}

/// Memoizing executor for the named steps of one run.
#[derive(Debug)]
pub struct StepRunner {
    ledger: StepLedger,
    policy: RetryPolicy,
}

impl StepRunner {
    pub fn new(ledger: StepLedger, policy: RetryPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn run_id(&self) -> &str {
        self.ledger.run_id()
    }

    pub fn ledger(&self) -> &StepLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut StepLedger {
        &mut self.ledger
    }

    /// Run `body` once per run under `name`, replaying its recorded result afterwards.
    ///
    /// Failed attempts are retried with exponential backoff; each wait is a
    /// durable sleep named `<name>/backoff-<n>`. Once attempts are exhausted the
    /// failure is recorded and returned as [`RunFailed`], and every later call
    /// for `name` returns the same failure without running `body`.
    pub fn run<T, F>(&mut self, name: &str, mut body: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Result<T>,
    {
        if let Some(record) = self.ledger.get(name) {
            match &record.status {
                StepStatus::Completed { output } => {
                    debug!(run_id = %self.ledger.run_id(), step = name, "replaying step");
                    return serde_json::from_value(output.clone())
                        .with_context(|| format!("decode recorded output of step '{name}'"));
                }
                StepStatus::Failed { error } => {
                    return Err(RunFailed {
                        run_id: self.ledger.run_id().to_string(),
                        step: name.to_string(),
                        attempts: record.attempts,
                        message: error.clone(),
                    }
                    .into());
                }
                StepStatus::Sleeping { .. } => {
                    bail!("step '{name}' is recorded as a sleep, not a step");
                }
            }
        }

        let mut attempt = 1u32;
        loop {
            debug!(run_id = %self.ledger.run_id(), step = name, attempt, "running step");
            match body() {
                Ok(value) => {
                    let output = serde_json::to_value(&value)
                        .with_context(|| format!("serialize output of step '{name}'"))?;
                    self.ledger.record(StepRecord {
                        name: name.to_string(),
                        status: StepStatus::Completed { output },
                        attempts: attempt,
                        recorded_at: Utc::now(),
                    })?;
                    return Ok(value);
                }
                Err(err) if attempt >= self.policy.max_attempts => {
                    let message = format!("{err:#}");
                    error!(
                        run_id = %self.ledger.run_id(),
                        step = name,
                        attempts = attempt,
                        err = %message,
                        "step failed permanently"
                    );
                    self.ledger.record(StepRecord {
                        name: name.to_string(),
                        status: StepStatus::Failed {
                            error: message.clone(),
                        },
                        attempts: attempt,
                        recorded_at: Utc::now(),
                    })?;
                    return Err(RunFailed {
                        run_id: self.ledger.run_id().to_string(),
                        step: name.to_string(),
                        attempts: attempt,
                        message,
                    }
                    .into());
                }
                Err(err) => {
                    let delay =
                        backoff_delay(attempt, self.policy.backoff_base, self.policy.backoff_max);
                    warn!(
                        run_id = %self.ledger.run_id(),
                        step = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        err = %format!("{err:#}"),
                        "step failed, retrying"
                    );
                    self.sleep(&format!("{name}/backoff-{attempt}"), delay)?;
                    attempt += 1;
                }
            }
        }
    }

    /// Durable sleep: the wake-up instant is recorded under `name`, so a
    /// re-driven run waits only for whatever is left of it.
    pub fn sleep(&mut self, name: &str, duration: Duration) -> Result<()> {
        let wake_at = match self.ledger.get(name).map(|record| &record.status) {
            Some(StepStatus::Sleeping { wake_at }) => *wake_at,
            Some(_) => bail!("step '{name}' is recorded as a step, not a sleep"),
            None => {
                let delta = TimeDelta::from_std(duration)
                    .with_context(|| format!("sleep '{name}' duration out of range"))?;
                let wake_at = Utc::now() + delta;
                self.ledger.record(StepRecord {
                    name: name.to_string(),
                    status: StepStatus::Sleeping { wake_at },
                    attempts: 1,
                    recorded_at: Utc::now(),
                })?;
                wake_at
            }
        };

        let remaining = (wake_at - Utc::now()).to_std().unwrap_or_default();
        if !remaining.is_zero() {
            debug!(
                run_id = %self.ledger.run_id(),
                step = name,
                remaining_ms = remaining.as_millis() as u64,
                "sleeping"
            );
            thread::sleep(remaining);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::Cell;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    fn runner(max_attempts: u32) -> StepRunner {
        StepRunner::new(StepLedger::in_memory("run-1"), policy(max_attempts))
    }

    /// A recorded step never runs its body again.
    #[test]
    fn completed_step_is_replayed() {
        let mut steps = runner(1);
        let calls = Cell::new(0);
        let body = || {
            calls.set(calls.get() + 1);
            Ok("sbx-1".to_string())
        };

        assert_eq!(steps.run("get-sandbox-id", body).expect("first"), "sbx-1");
        assert_eq!(steps.run("get-sandbox-id", body).expect("replay"), "sbx-1");
        assert_eq!(calls.get(), 1);
    }

    /// Replays survive reopening the ledger from disk.
    #[test]
    fn replay_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("steps.json");

        let mut steps = StepRunner::new(StepLedger::open("run-1", &path).expect("open"), policy(1));
        steps.run("answer", || Ok(42u32)).expect("run");
        drop(steps);

        let ledger = StepLedger::open("run-1", &path).expect("reopen");
        let mut steps = StepRunner::new(ledger, policy(1));
        let replayed: u32 = steps
            .run("answer", || -> Result<u32> { panic!("body must not run on replay") })
            .expect("replay");
        assert_eq!(replayed, 42);
    }

    #[test]
    fn transient_failure_is_retried_with_backoff_sleeps() {
        let mut steps = runner(3);
        let calls = Cell::new(0);
        let value = steps
            .run("flaky", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(7u8)
                }
            })
            .expect("eventually succeeds");

        assert_eq!(value, 7);
        let names: Vec<&str> = steps
            .ledger()
            .records()
            .iter()
            .map(|record| record.name.as_str())
            .collect();
        assert_eq!(names, vec!["flaky/backoff-1", "flaky/backoff-2", "flaky"]);
        assert_eq!(steps.ledger().get("flaky").expect("record").attempts, 3);
    }

    /// Exhausted retries record the failure; replays return it without running the body.
    #[test]
    fn exhausted_step_fails_run_and_replays_failure() {
        let mut steps = runner(2);
        let calls = Cell::new(0);
        let body = || -> Result<()> {
            calls.set(calls.get() + 1);
            Err(anyhow!("sandbox service unavailable"))
        };

        let err = steps.run("get-sandbox-id", body).unwrap_err();
        let failed = err.downcast_ref::<RunFailed>().expect("RunFailed");
        assert_eq!(failed.step, "get-sandbox-id");
        assert_eq!(failed.attempts, 2);
        assert!(failed.message.contains("unavailable"));

        let err = steps.run("get-sandbox-id", body).unwrap_err();
        assert!(err.downcast_ref::<RunFailed>().is_some());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn cleared_failure_runs_again() {
        let mut steps = runner(1);
        steps
            .run("save-result", || -> Result<()> { Err(anyhow!("disk full")) })
            .unwrap_err();

        assert_eq!(steps.ledger_mut().clear_failed().expect("clear"), 1);
        steps.run("save-result", || Ok(())).expect("rerun");
    }

    #[test]
    fn sleep_is_recorded_once() {
        let mut steps = runner(1);
        steps.sleep("pause", Duration::from_millis(5)).expect("sleep");
        let first = steps.ledger().get("pause").expect("record").clone();

        steps.sleep("pause", Duration::from_secs(3600)).expect("replay");
        assert_eq!(steps.ledger().get("pause").expect("record"), &first);
    }

    #[test]
    fn step_and_sleep_names_do_not_mix() {
        let mut steps = runner(1);
        steps.run("work", || Ok(1u8)).expect("run");
        assert!(steps.sleep("work", Duration::ZERO).is_err());

        steps.sleep("nap", Duration::ZERO).expect("sleep");
        assert!(steps.run("nap", || Ok(1u8)).is_err());
    }
}
