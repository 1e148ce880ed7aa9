//! Error types for the training launcher

use thiserror::Error;

/// Result type alias using the launcher Error
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code used when a failure carries no better code of its own
pub const DEFAULT_FAILURE_CODE: i32 = 1;

/// Exit code reported when the launcher itself was asked to stop (128 + SIGTERM)
pub const SHUTDOWN_EXIT_CODE: i32 = 143;

/// Core error type for the training launcher
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Entry point not found: {path}")]
    EntryPointNotFound { path: String },

    #[error("Entry point is not executable: {path}")]
    EntryPointNotExecutable { path: String },

    #[error("Entry point is not readable: {path}")]
    EntryPointNotReadable { path: String },

    #[error("Unsupported entry point for {mode}: {reason}")]
    UnsupportedEntryPoint { mode: String, reason: String },

    #[error("Daemon executable not found: {path}")]
    DaemonNotFound { path: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Rendezvous errors
    #[error("Rendezvous timeout after {timeout_ms}ms, unreachable hosts: {}", unreachable.join(", "))]
    Rendezvous {
        unreachable: Vec<String>,
        timeout_ms: u64,
    },

    // Process errors
    #[error("Process exited with code {exit_code}: {message}")]
    ProcessFailure { exit_code: i32, message: String },

    #[error("Process was killed for running out of memory (exit code {exit_code})")]
    OutOfMemory { exit_code: i32 },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Launcher shutdown requested during {phase}")]
    ShutdownRequested { phase: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is a configuration error (bad or missing
    /// entry point, bad snapshot, missing daemon)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::EntryPointNotFound { .. }
                | Error::EntryPointNotExecutable { .. }
                | Error::EntryPointNotReadable { .. }
                | Error::UnsupportedEntryPoint { .. }
                | Error::DaemonNotFound { .. }
                | Error::InvalidConfig { .. }
        )
    }

    /// Returns true for any failure of the user's own process
    pub fn is_process_failure(&self) -> bool {
        matches!(
            self,
            Error::ProcessFailure { .. } | Error::OutOfMemory { .. }
        )
    }

    /// Returns true when the fault lies with the user program or its
    /// configuration rather than with the launcher itself
    pub fn is_client_error(&self) -> bool {
        self.is_configuration() || self.is_process_failure() || matches!(self, Error::Spawn { .. })
    }

    /// Exit code to report for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ProcessFailure { exit_code, .. } | Error::OutOfMemory { exit_code } => {
                *exit_code
            }
            Error::ShutdownRequested { .. } => SHUTDOWN_EXIT_CODE,
            _ => DEFAULT_FAILURE_CODE,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
