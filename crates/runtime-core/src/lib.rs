//! Runtime Core - Foundation for the training launcher
//!
//! Provides the execution environment snapshot, the error taxonomy,
//! runtime configuration and the async runtime/shutdown plumbing shared
//! by the process supervisor, the rendezvous coordinator and the launch
//! strategies.

pub mod config;
pub mod error;
pub mod host;
pub mod runtime;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use host::{elect_leader, HostRole};
pub use runtime::{CancellationToken, RuntimeManager};
pub use types::*;
