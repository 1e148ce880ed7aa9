//! Exit status classification

use runtime_core::config::SupervisorConfig;
use runtime_core::error::DEFAULT_FAILURE_CODE;
use runtime_core::{Failure, RunResult};
use std::process::ExitStatus;

use crate::tail::StderrTail;

/// How a process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,

    /// Terminating signal, when the process was killed
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code as a shell would report it: `128 + signal` for signals
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => DEFAULT_FAILURE_CODE,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    #[cfg(unix)]
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    #[cfg(not(unix))]
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
        }
    }
}

/// Map a terminated process to a [`RunResult`]
///
/// Only the exit status decides between success and failure; the tail
/// supplies the message and error class of a failure.
pub fn classify(
    outcome: ExitOutcome,
    tail: Option<&StderrTail>,
    config: &SupervisorConfig,
) -> RunResult {
    if outcome.success() {
        return RunResult::Success;
    }

    let exit_code = outcome.exit_code();
    if config.oom.is_oom(outcome.code, outcome.signal) {
        return RunResult::Failure(Failure::out_of_memory(exit_code));
    }

    let message = match tail {
        Some(tail) if !tail.is_empty() => tail.to_message(),
        _ => match outcome.signal {
            Some(signal) => format!("Process was terminated by signal {}", signal),
            None => format!("Process exited with code {}", exit_code),
        },
    };
    let error_class = tail
        .and_then(|t| t.find_signature(&config.error_signatures))
        .map(str::to_string);

    RunResult::Failure(Failure::new(exit_code, message).with_error_class(error_class))
}
