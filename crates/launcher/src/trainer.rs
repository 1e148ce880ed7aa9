//! One training invocation on one host

use std::sync::Arc;

use chrono::Utc;
use process::SinkHandle;
use rendezvous::RendezvousCoordinator;
use runtime_core::{
    CancellationToken, Error, ExecutionEnvironment, Result, RunReport, RunResult, RuntimeConfig,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::reporter::OutcomeReporter;
use crate::strategy::{DistributedLauncher, LaunchContext};

/// Validates, waits for hosts, launches and reports
pub struct TrainingRun {
    context: LaunchContext,
    reporter: Arc<dyn OutcomeReporter>,
}

impl TrainingRun {
    pub fn new(
        config: RuntimeConfig,
        sink: SinkHandle,
        reporter: Arc<dyn OutcomeReporter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            context: LaunchContext::new(config, sink, shutdown),
            reporter,
        }
    }

    /// Create a run from a prepared launch context
    pub fn with_context(context: LaunchContext, reporter: Arc<dyn OutcomeReporter>) -> Self {
        Self { context, reporter }
    }

    pub fn context(&self) -> &LaunchContext {
        &self.context
    }

    /// Execute `env` to completion and report the outcome
    ///
    /// Never fails: every error ends up as the failure of the report.
    pub async fn run(&self, env: &ExecutionEnvironment) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            host = %env.current_host,
            hosts = env.hosts.len(),
            mode = env.distribution.mode_name(),
            entry_point = %env.entry_point,
            "Starting training run"
        );

        let result = match self.execute(env).await {
            Ok(result) => result,
            Err(e) => {
                error!(run_id = %run_id, error = %e, client_error = e.is_client_error(), "Training run aborted");
                RunResult::from_error(&e)
            }
        };

        let report = RunReport::finish(run_id, env.current_host.clone(), started_at, result);
        match &report.result {
            RunResult::Success => info!(
                run_id = %run_id,
                elapsed_ms = report.elapsed().as_millis() as u64,
                "Training run succeeded"
            ),
            RunResult::Failure(f) => warn!(
                run_id = %run_id,
                exit_code = f.exit_code,
                oom = f.aborted_due_to_oom,
                elapsed_ms = report.elapsed().as_millis() as u64,
                "Training run failed"
            ),
        }

        if let Err(e) = self.reporter.report(&report).await {
            error!(run_id = %run_id, error = %e, "Failed to report outcome");
        }
        report
    }

    async fn execute(&self, env: &ExecutionEnvironment) -> Result<RunResult> {
        env.validate()?;
        let shutdown = &self.context.shutdown;

        if env.is_distributed() {
            let config = &self.context.config.rendezvous;
            let coordinator = RendezvousCoordinator::from_config(config)
                .with_timeout(env.rendezvous_timeout.unwrap_or(config.timeout));
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(shutdown_during("rendezvous")),
                outcome = coordinator.wait_for_hosts(&env.hosts, &env.current_host) => outcome?,
            };
            info!(leader = %outcome.leader, role = %outcome.role, "Hosts ready");
        }

        if shutdown.is_cancelled() {
            return Err(shutdown_during("launch"));
        }
        let launcher = DistributedLauncher::for_environment(env);
        info!(strategy = launcher.name(), "Launching entry point");
        Ok(launcher.launch(&self.context, env).await)
    }
}

fn shutdown_during(phase: &str) -> Error {
    warn!(phase = phase, "Shutdown requested, not continuing");
    Error::ShutdownRequested {
        phase: phase.to_string(),
    }
}
