//! Training launcher binary entry point
//!
//! Usage: `training-launcher <environment.json> [config.json]`
//!
//! Runs the entry point described by the environment snapshot, writes
//! the outcome sentinel file and exits 0 on success, 1 on failure.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use launcher::{OutcomeReporter, SentinelFileReporter, TrainingRun};
use process::StdioSink;
use runtime_core::{
    Error, ExecutionEnvironment, RunReport, RunResult, RuntimeConfig, RuntimeManager,
};

const WORKER_THREADS: usize = 4;

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "training_launcher=info,launcher=info,process=info,rendezvous=info,runtime_core=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(env_path) = args.next() else {
        eprintln!("usage: training-launcher <environment.json> [config.json]");
        return ExitCode::from(2);
    };

    let config = match args.next() {
        Some(path) => match RuntimeConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => RuntimeConfig::default(),
    };

    let manager = match RuntimeManager::new(WORKER_THREADS) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };
    manager.forward_os_signals();

    let reporter = Arc::new(SentinelFileReporter::new(&config.reporter.output_dir));

    let report = manager.block_on(async {
        match ExecutionEnvironment::from_file(&env_path) {
            Ok(env) => {
                tracing::info!(path = %env_path, "Loaded execution environment");
                let run = TrainingRun::new(
                    config,
                    Arc::new(StdioSink),
                    reporter.clone(),
                    manager.shutdown_token(),
                );
                run.run(&env).await
            }
            Err(e) => report_load_failure(reporter.as_ref(), &env_path, e).await,
        }
    });

    if report.result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn report_load_failure(
    reporter: &dyn OutcomeReporter,
    path: &str,
    error: Error,
) -> RunReport {
    tracing::error!(path = %path, error = %error, "Failed to load execution environment");
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let report = RunReport::finish(
        uuid::Uuid::new_v4(),
        host,
        chrono::Utc::now(),
        RunResult::from_error(&error),
    );
    if let Err(e) = reporter.report(&report).await {
        tracing::error!(error = %e, "Failed to report outcome");
    }
    report
}
