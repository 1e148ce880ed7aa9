//! Training process supervision
//!
//! This crate provides:
//! - **Command building**: entry point kind detection, interpreter
//!   selection, shell quoting and environment derivation
//! - **Stream supervision**: stdout and stderr drained concurrently from
//!   spawn to EOF, split into bounded lines and forwarded to an
//!   [`OutputSink`]; each process leads its own process group
//! - **Exit classification**: exit status to [`RunResult`], with a bounded
//!   stderr tail as the failure message and a configurable OOM predicate
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use process::{CommandBuilder, ProcessSupervisor, StdioSink};
//! use runtime_core::{ExecutionEnvironment, RuntimeConfig};
//!
//! let config = RuntimeConfig::default();
//! let env = ExecutionEnvironment::single_host("algo-1", "train.py", "/opt/ml/code");
//!
//! let spec = CommandBuilder::new(&config.supervisor).build(&env)?;
//! let supervisor = ProcessSupervisor::new(config.supervisor, Arc::new(StdioSink));
//! let result = supervisor.run(&spec, true).await;
//! ```

mod command;
mod exit;
mod lines;
pub mod quote;
mod sink;
mod supervisor;
mod tail;

pub use command::{log_invocation, CommandBuilder, CommandSpec, EntryCommand, EntryPointKind};
pub use exit::{classify, ExitOutcome};
pub use sink::{CapturedLine, MemorySink, OutputSink, SinkHandle, StdioSink, StreamKind, TracingSink};
pub use lines::LineSplitter;
pub use supervisor::{ProcessSupervisor, RunHandle};
pub use tail::StderrTail;

// Re-export types from runtime-core for convenience
pub use runtime_core::types::{Failure, RunResult};
