//! Child process execution with timeouts, bounded capture, and line streaming.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output is still collected after the child exits while its pipes
/// stay open.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Bounded buffer that counts what it had to drop.
#[derive(Debug, Default)]
struct Capture {
    buf: Vec<u8>,
    truncated: usize,
}

impl Capture {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let remaining = limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

/// Run a command to completion, feeding `stdin` and capturing output.
#[instrument(
    skip_all,
    fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes)
)]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_streaming(cmd, stdin, timeout, output_limit_bytes, &mut |_, _| {})
}

/// Run a command, invoking `on_output` for every line as it arrives.
///
/// Lines are delivered on the calling thread while the child runs, including
/// their trailing newline, so concatenating them reproduces the stream.
/// `output_limit_bytes` bounds only the returned capture; callbacks still see
/// everything. On timeout the child is killed and whatever was read so far is
/// returned with `timed_out` set. A child that exits while background jobs
/// still hold its pipes returns promptly with its own exit status.
#[instrument(
    skip_all,
    fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes)
)]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    on_output: &mut dyn FnMut(Stream, &str),
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // A separate writer keeps a large prompt from deadlocking against a full stdout pipe.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    let tx_err = tx.clone();
    let stdout_handle = thread::spawn(move || pump_lines(stdout, Stream::Stdout, tx));
    let stderr_handle = thread::spawn(move || pump_lines(stderr, Stream::Stderr, tx_err));

    let deadline = Instant::now() + timeout;
    let mut out = Capture::default();
    let mut err = Capture::default();
    let mut deliver = |stream: Stream, chunk: Vec<u8>| {
        match stream {
            Stream::Stdout => out.push(&chunk, output_limit_bytes),
            Stream::Stderr => err.push(&chunk, output_limit_bytes),
        }
        on_output(stream, &String::from_utf8_lossy(&chunk));
    };

    // Background jobs started by the command can keep the pipes open after
    // the child exits, so the child is polled instead of waiting for EOF.
    let mut timed_out = false;
    let mut pipes_closed = false;
    let mut exited: Option<ExitStatus> = None;
    let mut drain_until: Option<Instant> = None;
    loop {
        let now = Instant::now();
        let limit = drain_until.unwrap_or(deadline);
        if now >= limit {
            timed_out = drain_until.is_none();
            break;
        }
        match rx.recv_timeout((limit - now).min(EXIT_POLL_INTERVAL)) {
            Ok((stream, chunk)) => deliver(stream, chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                pipes_closed = true;
                break;
            }
        }
        if exited.is_none()
            && let Some(status) = child.try_wait().context("poll command")?
        {
            exited = Some(status);
            drain_until = Some(Instant::now() + EXIT_DRAIN_GRACE);
        }
    }

    let status = match exited {
        Some(status) => status,
        None => {
            let status = if timed_out {
                None
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                child.wait_timeout(remaining).context("wait for command")?
            };
            match status {
                Some(status) => status,
                None => {
                    warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
                    timed_out = true;
                    child.kill().context("kill command")?;
                    child.wait().context("wait command after kill")?
                }
            }
        }
    };

    if pipes_closed {
        join_reader(stdout_handle).context("join stdout")?;
        join_reader(stderr_handle).context("join stderr")?;
    } else {
        // Something still holds the pipes open; keep what already arrived and
        // leave the reader threads detached.
        if !timed_out {
            debug!("command exited with output pipes still open, detaching readers");
        }
        for (stream, chunk) in rx.try_iter() {
            deliver(stream, chunk);
        }
    }

    if out.truncated > 0 || err.truncated > 0 {
        warn!(
            stdout_truncated = out.truncated,
            stderr_truncated = err.truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: out.buf,
        stderr: err.buf,
        stdout_truncated: out.truncated,
        stderr_truncated: err.truncated,
        timed_out,
    })
}

fn pump_lines<R: Read>(reader: R, stream: Stream, tx: Sender<(Stream, Vec<u8>)>) -> Result<()> {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        if tx.send((stream, line)).is_err() {
            // Receiver is gone (timed out); drain silently.
            return Ok(());
        }
    }
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}
