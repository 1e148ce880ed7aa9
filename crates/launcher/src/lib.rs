//! Launcher - Runs one training invocation on one host
//!
//! Ties the pieces together:
//! - **Strategies**: plain local processes, MPI (leader/worker, optionally
//!   SMDDP), torchrun and generic external launchers
//! - **Training run**: validation, host rendezvous, launch and reporting
//! - **Reporting**: success/failure sentinel files for the platform

pub mod reporter;
pub mod strategy;
mod trainer;

pub use reporter::{OutcomeReporter, SentinelFileReporter};
pub use strategy::{DistributedLauncher, LaunchContext};
pub use trainer::TrainingRun;
