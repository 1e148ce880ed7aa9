//! Process supervision against real child processes
//!
//! Covers the stream-draining contract:
//! - Megabytes on one stream and nothing on the other never deadlock
//! - Exit status alone decides success
//! - Failures carry the exact exit code and the stderr tail

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use process::{CommandSpec, MemorySink, ProcessSupervisor, StreamKind};
use runtime_core::config::SupervisorConfig;
use runtime_core::RunResult;

const LINES: usize = 50_000;

fn sh(script: &str) -> CommandSpec {
    CommandSpec::from_argv(vec!["/bin/sh".into(), "-c".into(), script.into()])
        .expect("argv is not empty")
        .label("script")
}

fn supervisor(config: SupervisorConfig) -> (ProcessSupervisor, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    (ProcessSupervisor::new(config, sink.clone()), sink)
}

async fn run_bounded(supervisor: &ProcessSupervisor, spec: &CommandSpec) -> Result<RunResult> {
    Ok(tokio::time::timeout(Duration::from_secs(60), supervisor.run(spec, true)).await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_megabytes_on_stdout_only() -> Result<()> {
    let (supervisor, sink) = supervisor(SupervisorConfig::default());
    // 50k lines of 41 bytes is about 2 MB
    let spec = sh(&format!(
        "yes 0123456789012345678901234567890123456789 | head -n {}",
        LINES
    ));

    let result = run_bounded(&supervisor, &spec).await?;

    assert_eq!(result, RunResult::Success);
    assert_eq!(sink.stream("script", StreamKind::Stdout).len(), LINES);
    assert!(sink.stream("script", StreamKind::Stderr).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_megabytes_on_stderr_only() -> Result<()> {
    let (supervisor, sink) = supervisor(SupervisorConfig::default());
    let spec = sh(&format!(
        "yes 0123456789012345678901234567890123456789 | head -n {} >&2",
        LINES
    ));

    let result = run_bounded(&supervisor, &spec).await?;

    // Noise on stderr does not turn a zero exit into a failure
    assert_eq!(result, RunResult::Success);
    assert_eq!(sink.stream("script", StreamKind::Stderr).len(), LINES);
    assert!(sink.stream("script", StreamKind::Stdout).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failure_reports_exit_code_and_tail() -> Result<()> {
    let config = SupervisorConfig {
        stderr_tail_lines: 2,
        error_signatures: vec!["ZeroDivisionError".to_string()],
        ..Default::default()
    };
    let (supervisor, sink) = supervisor(config);
    let spec = sh(
        "echo 'epoch 1' ; echo 'Traceback (most recent call last):' >&2; \
         echo '  File \"train.py\", line 3' >&2; \
         echo 'ZeroDivisionError: division by zero' >&2; exit 42",
    );

    let result = run_bounded(&supervisor, &spec).await?;
    let failure = result.failure().expect("non-zero exit is a failure");

    assert_eq!(failure.exit_code, 42);
    assert_eq!(
        failure.message,
        "  File \"train.py\", line 3\nZeroDivisionError: division by zero"
    );
    assert_eq!(failure.error_class.as_deref(), Some("ZeroDivisionError"));
    assert!(!failure.aborted_due_to_oom);

    // The full stream still reached the sink
    assert_eq!(sink.stream("script", StreamKind::Stderr).len(), 3);
    assert_eq!(sink.stream("script", StreamKind::Stdout), vec!["epoch 1"]);
    Ok(())
}

#[tokio::test]
async fn test_sigkill_is_reported_as_out_of_memory() -> Result<()> {
    let (supervisor, _sink) = supervisor(SupervisorConfig::default());
    let result = run_bounded(&supervisor, &sh("echo allocating >&2; kill -9 $$")).await?;

    let failure = result.failure().expect("killed process is a failure");
    assert!(failure.aborted_due_to_oom);
    assert_eq!(failure.message, "out of memory");
    assert_eq!(failure.exit_code, 137);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_processes_keep_their_own_order() -> Result<()> {
    let (supervisor, sink) = supervisor(SupervisorConfig::default());

    let mut runs = tokio::task::JoinSet::new();
    for i in 0..4 {
        let supervisor = supervisor.clone();
        let spec = sh("i=0; while [ $i -lt 500 ]; do echo $i; i=$((i+1)); done")
            .label(format!("local-rank-{}", i));
        runs.spawn(async move { supervisor.run(&spec, true).await });
    }
    while let Some(result) = runs.join_next().await {
        assert!(result?.is_success());
    }

    let expected: Vec<String> = (0..500).map(|n| n.to_string()).collect();
    for i in 0..4 {
        assert_eq!(
            sink.stream(&format!("local-rank-{}", i), StreamKind::Stdout),
            expected
        );
    }
    Ok(())
}
