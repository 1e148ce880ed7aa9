//! Process supervisor
//!
//! Spawns exactly one OS process per call and drains its stdout and
//! stderr on two concurrently running tasks from the moment of spawn
//! until EOF, so a chatty child can never block on a full pipe while the
//! supervisor waits on the other stream.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use runtime_core::config::SupervisorConfig;
use runtime_core::error::{DEFAULT_FAILURE_CODE, SHUTDOWN_EXIT_CODE};
use runtime_core::{CancellationToken, Error, Failure, Result, RunResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::CommandSpec;
use crate::exit::{classify, ExitOutcome};
use crate::lines::LineSplitter;
use crate::sink::{SinkHandle, StreamKind};
use crate::tail::StderrTail;

/// Exit code reported when the executable does not exist
const EXIT_NOT_FOUND: i32 = 127;

/// Exit code reported when the executable cannot be run
const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Read size of the output drains
const DRAIN_CHUNK_BYTES: usize = 8 * 1024;

type SharedTail = Arc<Mutex<StderrTail>>;

/// Runs commands and turns their termination into [`RunResult`]s
#[derive(Clone)]
pub struct ProcessSupervisor {
    /// Tail size, OOM policy and error signatures
    config: Arc<SupervisorConfig>,

    /// Destination of every output line
    sink: SinkHandle,
}

impl ProcessSupervisor {
    /// Create a supervisor writing output to `sink`
    pub fn new(config: SupervisorConfig, sink: SinkHandle) -> Self {
        Self {
            config: Arc::new(config),
            sink,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start `spec` without waiting for it
    ///
    /// The process leads a new process group, so a kill reaches everything
    /// it started. With `capture_error` the last stderr lines are kept and
    /// become the failure message; either way stderr is forwarded to the
    /// sink.
    pub fn spawn(&self, spec: &CommandSpec, capture_error: bool) -> Result<RunHandle> {
        let command_line = spec.render();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if spec.clear_env {
            command.env_clear();
        }
        command.envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id();

        let tail: Option<SharedTail> = capture_error.then(|| {
            Arc::new(Mutex::new(
                StderrTail::new(self.config.stderr_tail_lines)
                    .with_max_bytes(self.config.stderr_tail_bytes),
            ))
        });

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(drain(
                stdout,
                spec.label.clone(),
                StreamKind::Stdout,
                self.sink.clone(),
                None,
                self.config.max_line_bytes,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain(
                stderr,
                spec.label.clone(),
                StreamKind::Stderr,
                self.sink.clone(),
                tail.clone(),
                self.config.max_line_bytes,
            )));
        }

        info!(
            label = %spec.label,
            pid = ?pid,
            command = %command_line,
            "Started process"
        );

        Ok(RunHandle {
            label: spec.label.clone(),
            command: command_line,
            pid,
            child,
            drains,
            tail,
            config: self.config.clone(),
        })
    }

    /// Run `spec` to completion
    pub async fn run(&self, spec: &CommandSpec, capture_error: bool) -> RunResult {
        match self.spawn(spec, capture_error) {
            Ok(handle) => handle.wait().await,
            Err(e) => spawn_failure(e),
        }
    }

    /// Run `spec` to completion, killing it once `shutdown` is cancelled
    ///
    /// Nothing is spawned when the shutdown was requested beforehand.
    pub async fn run_until_shutdown(
        &self,
        spec: &CommandSpec,
        capture_error: bool,
        shutdown: &CancellationToken,
    ) -> RunResult {
        if shutdown.is_cancelled() {
            info!(label = %spec.label, "Shutdown requested, not starting process");
            return RunResult::Failure(
                Failure::new(
                    SHUTDOWN_EXIT_CODE,
                    "Launcher shutdown requested before the process started",
                )
                .with_command(spec.render()),
            );
        }
        match self.spawn(spec, capture_error) {
            Ok(handle) => handle.wait_or_shutdown(shutdown).await,
            Err(e) => spawn_failure(e),
        }
    }
}

/// Convert a spawn error into the failure of the process that never ran
fn spawn_failure(err: Error) -> RunResult {
    match err {
        Error::Spawn { command, source } => {
            let exit_code = match source.kind() {
                std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
                std::io::ErrorKind::PermissionDenied => EXIT_NOT_EXECUTABLE,
                _ => DEFAULT_FAILURE_CODE,
            };
            error!(command = %command, error = %source, "Failed to spawn process");
            let message = format!("Failed to spawn `{}`: {}", command, source);
            RunResult::Failure(Failure::new(exit_code, message).with_command(command))
        }
        other => RunResult::from_error(&other),
    }
}

/// A live supervised process
pub struct RunHandle {
    label: String,
    command: String,
    pid: Option<u32>,
    child: Child,
    drains: Vec<JoinHandle<()>>,
    tail: Option<SharedTail>,
    config: Arc<SupervisorConfig>,
}

impl RunHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Rendered command line
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Send SIGKILL to the process group without waiting
    pub fn start_kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: killpg only sends a signal. The child is not reaped
            // before `wait` returns, so its pid still names the group it
            // was spawned into.
            if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } == 0 {
                return Ok(());
            }
            debug!(
                label = %self.label,
                error = %std::io::Error::last_os_error(),
                "Failed to signal process group"
            );
        }
        self.child.start_kill().map_err(Error::from)
    }

    /// Kill the process group and reap the process
    pub async fn terminate(mut self) -> RunResult {
        if let Err(e) = self.start_kill() {
            debug!(label = %self.label, error = %e, "Process already gone");
        }
        let status = self.child.wait().await;
        self.finish(status, true).await
    }

    /// Wait for termination and for both streams to reach EOF, or for
    /// `drain_timeout` to pass after termination
    pub async fn wait(mut self) -> RunResult {
        let status = self.child.wait().await;
        self.finish(status, false).await
    }

    /// Like [`wait`](Self::wait), but kill the process group on shutdown
    ///
    /// A killed process is reported with its signal exit code; it is never
    /// classified as out of memory.
    pub async fn wait_or_shutdown(mut self, shutdown: &CancellationToken) -> RunResult {
        let mut killed = false;
        let status = tokio::select! {
            status = self.child.wait() => status,
            _ = shutdown.cancelled() => {
                warn!(label = %self.label, pid = ?self.pid, "Shutdown requested, killing process");
                killed = true;
                if let Err(e) = self.start_kill() {
                    debug!(label = %self.label, error = %e, "Process already gone");
                }
                self.child.wait().await
            }
        };
        self.finish(status, killed).await
    }

    /// Join the output drains, giving up on streams a surviving
    /// descendant still holds open after `drain_timeout`
    async fn join_drains(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        for mut task in self.drains.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(label = %self.label, error = %e, "Output drain task failed"),
                Err(_) => {
                    warn!(
                        label = %self.label,
                        timeout = ?self.config.drain_timeout,
                        "Output still open after process exit, no longer reading it"
                    );
                    task.abort();
                }
            }
        }
    }

    async fn finish(mut self, status: std::io::Result<ExitStatus>, killed: bool) -> RunResult {
        self.join_drains().await;
        let tail = self.tail.take().map(|tail| tail.lock().clone());

        let outcome = match status {
            Ok(status) => ExitOutcome::from(status),
            Err(e) => {
                error!(label = %self.label, error = %e, "Failed to wait for process");
                return RunResult::Failure(
                    Failure::new(DEFAULT_FAILURE_CODE, format!("Failed to wait for process: {}", e))
                        .with_command(self.command.clone()),
                );
            }
        };

        let result = if killed && !outcome.success() {
            RunResult::Failure(Failure::new(
                outcome.exit_code(),
                "Process was terminated on launcher shutdown",
            ))
        } else {
            classify(outcome, tail.as_ref(), &self.config)
        };

        match result {
            RunResult::Success => {
                info!(label = %self.label, pid = ?self.pid, "Process exited successfully");
                RunResult::Success
            }
            RunResult::Failure(failure) => {
                warn!(
                    label = %self.label,
                    pid = ?self.pid,
                    exit_code = failure.exit_code,
                    oom = failure.aborted_due_to_oom,
                    "Process failed"
                );
                RunResult::Failure(failure.with_command(self.command.clone()))
            }
        }
    }
}

/// Forward every line of `reader` to `sink` until EOF
async fn drain<R>(
    mut reader: R,
    label: String,
    stream: StreamKind,
    sink: SinkHandle,
    tail: Option<SharedTail>,
    max_line_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; DRAIN_CHUNK_BYTES];
    let mut splitter = LineSplitter::new(max_line_bytes);
    let mut truncated_lines = 0usize;
    let mut forward = |line: &[u8], truncated: bool| {
        if truncated {
            truncated_lines += 1;
        }
        let line = String::from_utf8_lossy(line);
        sink.line(&label, stream, &line);
        if let Some(tail) = &tail {
            tail.lock().push(line.into_owned());
        }
    };

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => splitter.push(&chunk[..n], &mut forward),
            Err(e) => {
                warn!(label = %label, stream = %stream, error = %e, "Stopped reading process output");
                break;
            }
        }
    }
    splitter.finish(&mut forward);

    if truncated_lines > 0 {
        warn!(
            label = %label,
            stream = %stream,
            lines = truncated_lines,
            max_line_bytes,
            "Cut overlong output lines"
        );
    }
    debug!(label = %label, stream = %stream, "Reached end of stream");
}
