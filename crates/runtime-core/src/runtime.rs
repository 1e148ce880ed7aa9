//! Async runtime manager

use crate::{Error, Result};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

pub use tokio_util::sync::CancellationToken;

/// Owns the Tokio runtime of one launcher invocation and its shutdown token
///
/// Shutdown is a latched state rather than an event: a component that
/// starts after the token was cancelled still observes it.
pub struct RuntimeManager {
    /// Tokio runtime
    runtime: Option<Runtime>,

    /// Cancelled once the launcher must stop
    shutdown: CancellationToken,
}

impl RuntimeManager {
    /// Create a new runtime manager with `worker_threads` runtime threads
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .enable_all()
            .thread_name("launcher-worker")
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        Ok(Self {
            runtime: Some(runtime),
            shutdown: CancellationToken::new(),
        })
    }

    /// Get a reference to the Tokio runtime
    pub fn runtime(&self) -> &Runtime {
        match &self.runtime {
            Some(runtime) => runtime,
            // Only `drop` takes the runtime out
            None => unreachable!("runtime accessed after shutdown"),
        }
    }

    /// Get a clone of the shutdown token
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown to all components
    pub fn shutdown(&self) {
        info!("Initiating launcher shutdown");
        self.shutdown.cancel();
    }

    /// Block on a future until completion
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime().block_on(future)
    }

    /// Spawn a task on the runtime
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime().spawn(future)
    }

    /// Cancel the shutdown token on SIGINT/SIGTERM for the rest of the run
    ///
    /// Keeps listening after the first signal so that repeated signals are
    /// consumed here instead of killing the launcher before it has reaped
    /// its children.
    pub fn forward_os_signals(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        self.spawn(async move {
            let mut received = 0u32;
            loop {
                if !wait_for_os_signal().await {
                    return;
                }
                received += 1;
                if received > 1 {
                    warn!(received, "Shutdown already in progress");
                }
                shutdown.cancel();
            }
        })
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.shutdown.cancel();

            // Give supervised children time to be reaped
            runtime.shutdown_timeout(Duration::from_secs(5));
            info!("Runtime manager shut down");
        }
    }
}

/// Wait for a termination signal (Ctrl+C or SIGTERM)
///
/// Returns false when no handler could be installed at all.
pub async fn wait_for_os_signal() -> bool {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            return false;
        }
        true
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => signal.recv().await.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                false
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = async { false };

    tokio::pin!(ctrl_c, terminate);
    let (mut ctrl_c_done, mut terminate_done) = (false, false);
    while !(ctrl_c_done && terminate_done) {
        tokio::select! {
            installed = &mut ctrl_c, if !ctrl_c_done => {
                if installed {
                    info!("Received Ctrl+C, terminating training processes");
                    return true;
                }
                ctrl_c_done = true;
            }
            installed = &mut terminate, if !terminate_done => {
                if installed {
                    info!("Received SIGTERM, terminating training processes");
                    return true;
                }
                terminate_done = true;
            }
        }
    }
    false
}
