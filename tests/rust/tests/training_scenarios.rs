//! End-to-end training scenarios
//!
//! Drives whole invocations through the launcher with stand-in
//! executables for the interpreter, the orchestrator and the SSH daemon:
//! - Single-host `train.py` with hyperparameters
//! - Two-host MPI `run.sh`, leader and worker side
//! - Sentinel files written for success and failure

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use launcher::{LaunchContext, SentinelFileReporter, TrainingRun};
use process::{CommandBuilder, MemorySink, StreamKind};
use runtime_core::{
    CancellationToken, DistributionConfig, ExecutionEnvironment, MpiOptions, RunResult,
    RuntimeConfig,
};
use tokio::net::TcpListener;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn executable(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn inherited_env() -> BTreeMap<String, String> {
    BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())])
}

fn context(config: RuntimeConfig, sink: Arc<MemorySink>) -> LaunchContext {
    let builder = CommandBuilder::new(&config.supervisor).with_inherited_env(inherited_env());
    LaunchContext::new(config, sink, CancellationToken::new()).with_builder(builder)
}

#[tokio::test]
async fn test_train_py_single_host() -> Result<()> {
    init_tracing();
    let tools = tempfile::tempdir()?;
    let code = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;
    std::fs::write(code.path().join("train.py"), "print('training')\n")?;

    let mut env = ExecutionEnvironment::single_host("algo-1", "train.py", code.path());
    env.args = vec!["--lr".to_string(), "0.01".to_string()];

    // The default builder yields the documented argv
    let argv = CommandBuilder::new(&RuntimeConfig::default().supervisor)
        .with_inherited_env(inherited_env())
        .build(&env)?
        .argv();
    assert_eq!(argv, vec!["python", "train.py", "--lr", "0.01"]);

    // Run it with a stand-in interpreter
    let python = executable(tools.path(), "python", r#"echo "interpreter: $*""#)?;
    let mut config = RuntimeConfig::default();
    config.supervisor.python_executable = python.display().to_string();
    config.reporter.output_dir = output.path().to_path_buf();

    let sink = Arc::new(MemorySink::new());
    let run = TrainingRun::with_context(
        context(config, sink.clone()),
        Arc::new(SentinelFileReporter::new(output.path())),
    );
    let report = run.run(&env).await;

    assert_eq!(report.result, RunResult::Success);
    assert_eq!(
        sink.stream("python", StreamKind::Stdout),
        vec!["interpreter: train.py --lr 0.01"]
    );
    assert!(output.path().join("success").exists());
    assert!(!output.path().join("failure").exists());
    Ok(())
}

#[tokio::test]
async fn test_failed_script_writes_failure_file() -> Result<()> {
    let code = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;
    executable(code.path(), "run.sh", "echo 'CUDA out of patience' >&2\nexit 3")?;

    let env = ExecutionEnvironment::single_host("algo-1", "run.sh", code.path());
    let run = TrainingRun::with_context(
        context(RuntimeConfig::default(), Arc::new(MemorySink::new())),
        Arc::new(SentinelFileReporter::new(output.path())),
    );
    let report = run.run(&env).await;

    assert_eq!(report.result.exit_code(), 3);
    let contents = std::fs::read_to_string(output.path().join("failure"))?;
    assert!(contents.starts_with("ExitCode 3\nErrorMessage \"CUDA out of patience\"\n"));
    assert!(contents.contains("Command \"/bin/sh -c ./run.sh\""));
    Ok(())
}

struct MpiCluster {
    _tools: tempfile::TempDir,
    code: tempfile::TempDir,
    scratch: tempfile::TempDir,
    listener: TcpListener,
    config: RuntimeConfig,
}

impl MpiCluster {
    /// Two hosts on this machine: `127.0.0.1` leads, `localhost` works
    async fn new(sshd_body: &str) -> Result<Self> {
        let tools = tempfile::tempdir()?;
        let code = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        executable(code.path(), "run.sh", "echo rank")?;

        let mpirun = executable(tools.path(), "mpirun", r#"echo "mpirun $*""#)?;
        let sshd = executable(tools.path(), "sshd", sshd_body)?;

        // Stands in for every host's SSH daemon port
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let mut config = RuntimeConfig::default();
        config.mpi.mpirun = mpirun.display().to_string();
        config.mpi.sshd = sshd;
        config.mpi.environment_file = Some(scratch.path().join("environment"));
        config.mpi.status_file_prefix = scratch.path().join("done").display().to_string();
        config.mpi.orted_process_name = "no-such-orted".to_string();
        config.mpi.job_poll_interval = Duration::from_millis(50);
        config.mpi.finish_grace = Duration::ZERO;
        config.rendezvous.timeout = Duration::from_secs(10);
        config.rendezvous.poll_interval = Duration::from_millis(100);

        Ok(Self {
            _tools: tools,
            code,
            scratch,
            listener,
            config,
        })
    }

    fn env(&self, current_host: &str) -> Result<ExecutionEnvironment> {
        let mut env = ExecutionEnvironment::single_host(current_host, "run.sh", self.code.path());
        env.hosts = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        env.distribution = DistributionConfig::Mpi(MpiOptions {
            processes_per_host: Some(2),
            ssh_port: self.listener.local_addr()?.port(),
            ..Default::default()
        });
        env.env_vars
            .insert("SM_CURRENT_HOST".to_string(), current_host.to_string());
        Ok(env)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpi_leader_runs_orchestrator() -> Result<()> {
    init_tracing();
    let cluster = MpiCluster::new("exec sleep 30").await?;
    let env = cluster.env("127.0.0.1")?;
    assert!(env.role().is_leader());

    let sink = Arc::new(MemorySink::new());
    let ctx = context(cluster.config.clone(), sink.clone());
    let launcher = launcher::DistributedLauncher::for_environment(&env);
    let result = tokio::time::timeout(Duration::from_secs(30), launcher.launch(&ctx, &env)).await?;

    assert_eq!(result, RunResult::Success);
    let lines = sink.stream("mpi", StreamKind::Stdout);
    assert_eq!(lines.len(), 1);
    let line = &lines[0];
    assert!(line.starts_with("mpirun --host 127.0.0.1:2,localhost:2 -np 4 --allow-run-as-root"));
    assert!(line.contains("-x SM_CURRENT_HOST"));
    assert!(line.ends_with("/bin/sh -c ./run.sh"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpi_worker_waits_for_job_completion() -> Result<()> {
    let cluster = MpiCluster::new("exec sleep 30").await?;
    let env = cluster.env("localhost")?;
    assert!(!env.role().is_leader());

    let sink = Arc::new(MemorySink::new());
    let ctx = context(cluster.config.clone(), sink.clone());
    let launcher = launcher::DistributedLauncher::for_environment(&env);

    // The leader announces the end of the job through the status file
    let status_file = cluster.scratch.path().join("done.127.0.0.1");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tokio::fs::write(status_file, b"").await;
    });

    let result = tokio::time::timeout(Duration::from_secs(30), launcher.launch(&ctx, &env)).await?;
    assert_eq!(result, RunResult::Success);

    // Remote ranks read their environment from this file
    let written = std::fs::read_to_string(cluster.scratch.path().join("environment"))?;
    assert!(written.contains("SM_CURRENT_HOST=localhost\n"));
    assert!(sink.stream("mpi", StreamKind::Stdout).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpi_worker_reports_its_own_daemon_exit() -> Result<()> {
    let cluster = MpiCluster::new("echo 'sshd: bind failed' >&2\nexit 5").await?;
    let env = cluster.env("localhost")?;

    let ctx = context(cluster.config.clone(), Arc::new(MemorySink::new()));
    let launcher = launcher::DistributedLauncher::for_environment(&env);
    let result = tokio::time::timeout(Duration::from_secs(30), launcher.launch(&ctx, &env)).await?;

    let failure = result.failure().expect("daemon exit is reported");
    assert_eq!(failure.exit_code, 5);
    assert_eq!(failure.message, "sshd: bind failed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpi_worker_ignores_status_file_of_earlier_job() -> Result<()> {
    let cluster = MpiCluster::new("sleep 0.5\nexit 5").await?;
    let env = cluster.env("localhost")?;

    // Left behind by a previous job on this host
    let stale = cluster.scratch.path().join("done.127.0.0.1");
    std::fs::write(&stale, b"")?;

    let ctx = context(cluster.config.clone(), Arc::new(MemorySink::new()));
    let launcher = launcher::DistributedLauncher::for_environment(&env);
    let result = tokio::time::timeout(Duration::from_secs(30), launcher.launch(&ctx, &env)).await?;

    // The worker kept waiting until its own daemon ended
    assert_eq!(result.exit_code(), 5);
    assert!(!stale.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpi_worker_stops_on_launcher_shutdown() -> Result<()> {
    let cluster = MpiCluster::new("exec sleep 30").await?;
    let env = cluster.env("localhost")?;

    let ctx = context(cluster.config.clone(), Arc::new(MemorySink::new()));
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();
    });

    let launcher = launcher::DistributedLauncher::for_environment(&env);
    let result = tokio::time::timeout(Duration::from_secs(10), launcher.launch(&ctx, &env)).await?;

    let failure = result.failure().expect("shutdown fails the run");
    assert_eq!(failure.exit_code, 137);
    assert_eq!(failure.message, "Process was terminated on launcher shutdown");
    Ok(())
}

