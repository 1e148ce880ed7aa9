//! Plain multi-process launch

use process::log_invocation;
use runtime_core::error::DEFAULT_FAILURE_CODE;
use runtime_core::{ExecutionEnvironment, Failure, RunResult};
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};

use super::LaunchContext;

/// Runs `processes_per_host` local copies of the entry point
#[derive(Debug, Clone)]
pub struct PlainLauncher {
    processes_per_host: usize,
}

impl PlainLauncher {
    pub fn new(processes_per_host: usize) -> Self {
        Self {
            processes_per_host: processes_per_host.max(1),
        }
    }

    pub fn processes_per_host(&self) -> usize {
        self.processes_per_host
    }

    /// Start every local process and wait for all of them
    ///
    /// The first failure becomes the aggregate result. With
    /// `abort_siblings_on_failure` the remaining processes are killed as
    /// soon as it is observed.
    pub async fn launch(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> RunResult {
        let entry = match ctx.builder.entry_command(env) {
            Ok(entry) => entry,
            Err(e) => return RunResult::from_error(&e),
        };

        let local = self.processes_per_host;
        let world_size = local * env.hosts.len();
        let host_rank = env.host_rank();

        let mut specs = Vec::with_capacity(local);
        for local_rank in 0..local {
            let spec = match ctx.builder.spec(env, entry.argv()) {
                Ok(spec) => spec,
                Err(e) => return RunResult::from_error(&e),
            };
            let label = if local == 1 {
                spec.label.clone()
            } else {
                format!("local-rank-{}", local_rank)
            };
            specs.push(
                spec.env("LOCAL_RANK", local_rank.to_string())
                    .env("LOCAL_WORLD_SIZE", local.to_string())
                    .env("RANK", (host_rank * local + local_rank).to_string())
                    .env("WORLD_SIZE", world_size.to_string())
                    .label(label),
            );
        }
        if let Some(first) = specs.first() {
            log_invocation(first, env);
        }

        info!(
            processes = local,
            world_size = world_size,
            host_rank = host_rank,
            "Launching local processes"
        );

        // Cancelled by the first failure, and with the launcher's shutdown
        let abort = ctx.shutdown.child_token();
        let mut tasks = JoinSet::new();
        for spec in specs {
            let supervisor = ctx.supervisor.clone();
            let abort = abort.clone();
            tasks.spawn(async move {
                let result = supervisor.run_until_shutdown(&spec, true, &abort).await;
                (spec.label, result)
            });
        }

        let abort_on_failure = ctx.config.launch.abort_siblings_on_failure;
        let mut first_failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (label, result) = task_result(joined);
            if let RunResult::Failure(failure) = result {
                if first_failure.is_none() {
                    warn!(
                        label = %label,
                        exit_code = failure.exit_code,
                        "Local process failed"
                    );
                    if abort_on_failure && !tasks.is_empty() {
                        info!(remaining = tasks.len(), "Terminating sibling processes");
                        abort.cancel();
                    }
                    first_failure = Some(failure);
                }
            }
        }

        match first_failure {
            Some(failure) => RunResult::Failure(failure),
            None => RunResult::Success,
        }
    }
}

/// Result of one local process task; a task that died counts as failed
fn task_result(joined: Result<(String, RunResult), JoinError>) -> (String, RunResult) {
    match joined {
        Ok(done) => done,
        Err(e) => {
            warn!(error = %e, "Local process task failed");
            (
                "local-process".to_string(),
                RunResult::Failure(Failure::new(
                    DEFAULT_FAILURE_CODE,
                    format!("Local process task failed: {}", e),
                )),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use process::{MemorySink, StreamKind};
    use runtime_core::error::SHUTDOWN_EXIT_CODE;
    use runtime_core::{CancellationToken, RuntimeConfig};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn context(sink: Arc<MemorySink>) -> LaunchContext {
        LaunchContext::new(RuntimeConfig::default(), sink, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_each_process_gets_its_rank() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "run.sh", r#"echo "$LOCAL_RANK/$LOCAL_WORLD_SIZE $RANK/$WORLD_SIZE""#);

        let mut env = ExecutionEnvironment::single_host("algo-2", "run.sh", dir.path());
        env.hosts = vec!["algo-1".to_string(), "algo-2".to_string()];

        let sink = Arc::new(MemorySink::new());
        let result = PlainLauncher::new(2).launch(&context(sink.clone()), &env).await;

        assert!(result.is_success());
        assert_eq!(sink.stream("local-rank-0", StreamKind::Stdout), vec!["0/2 2/4"]);
        assert_eq!(sink.stream("local-rank-1", StreamKind::Stdout), vec!["1/2 3/4"]);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_siblings() {
        let dir = tempfile::tempdir().unwrap();
        script(
            dir.path(),
            "run.sh",
            r#"if [ "$LOCAL_RANK" = "1" ]; then echo "rank 1 broke" >&2; exit 3; fi
exec sleep 30"#,
        );
        let env = ExecutionEnvironment::single_host("algo-1", "run.sh", dir.path());

        let sink = Arc::new(MemorySink::new());
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            PlainLauncher::new(3).launch(&context(sink), &env),
        )
        .await
        .unwrap();

        let failure = result.failure().unwrap();
        assert_eq!(failure.exit_code, 3);
        assert_eq!(failure.message, "rank 1 broke");
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::single_host("algo-1", "missing.sh", dir.path());

        let result = PlainLauncher::new(1)
            .launch(&context(Arc::new(MemorySink::new())), &env)
            .await;
        assert!(result.failure().unwrap().message.contains("Entry point not found"));
    }

    #[tokio::test]
    async fn test_shutdown_before_launch_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "run.sh", "touch started; exec sleep 3");
        let env = ExecutionEnvironment::single_host("algo-1", "run.sh", dir.path());

        // A signal that arrived while the launcher was still preparing
        let ctx = context(Arc::new(MemorySink::new()));
        ctx.shutdown.cancel();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            PlainLauncher::new(2).launch(&ctx, &env),
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.exit_code(), SHUTDOWN_EXIT_CODE);
        assert!(!dir.path().join("started").exists());
    }

    #[tokio::test]
    async fn test_shutdown_during_launch_kills_every_rank() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "run.sh", "exec sleep 30");
        let env = ExecutionEnvironment::single_host("algo-1", "run.sh", dir.path());

        let ctx = context(Arc::new(MemorySink::new()));
        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            PlainLauncher::new(2).launch(&ctx, &env),
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code(), 137);
    }

    #[tokio::test]
    async fn test_panicked_task_counts_as_failure() {
        let joined = tokio::spawn(async {
            panic!("supervisor task died");
        })
        .await
        .map(|()| ("rank".to_string(), RunResult::Success));

        let (_, result) = task_result(joined);
        let failure = result.failure().unwrap();
        assert_eq!(failure.exit_code, DEFAULT_FAILURE_CODE);
        assert!(failure.message.starts_with("Local process task failed"));
    }
}
