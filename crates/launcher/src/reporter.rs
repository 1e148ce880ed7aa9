//! Outcome reporting
//!
//! The platform learns the outcome of a run from sentinel files in the
//! output directory: an empty `success` file, or a `failure` file with
//! the exit code, the failure message and the failed command.

use async_trait::async_trait;
use runtime_core::{Result, RunReport, RunResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Publishes the result of a finished run
#[async_trait]
pub trait OutcomeReporter: Send + Sync {
    async fn report(&self, report: &RunReport) -> Result<()>;
}

/// Writes `success`/`failure` sentinel files
#[derive(Debug, Clone)]
pub struct SentinelFileReporter {
    output_dir: PathBuf,
}

impl SentinelFileReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn success_path(&self) -> PathBuf {
        self.output_dir.join("success")
    }

    pub fn failure_path(&self) -> PathBuf {
        self.output_dir.join("failure")
    }
}

/// Render the contents of a failure file
pub fn failure_contents(result: &RunResult) -> Option<String> {
    let failure = result.failure()?;
    let mut contents = format!(
        "ExitCode {}\nErrorMessage \"{}\"\n",
        failure.exit_code, failure.message
    );
    if let Some(class) = &failure.error_class {
        contents.push_str(&format!("ErrorClass {}\n", class));
    }
    contents.push_str(&format!(
        "Command \"{}\"\n",
        failure.command.as_deref().unwrap_or_default()
    ));
    Some(contents)
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl OutcomeReporter for SentinelFileReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        match failure_contents(&report.result) {
            None => {
                tokio::fs::write(self.success_path(), b"").await?;
                info!(path = %self.success_path().display(), "Wrote success file");
            }
            Some(contents) => {
                let path = self.failure_path();
                // The first recorded failure wins
                if exists(&path).await {
                    warn!(path = %path.display(), "Failure file already exists, keeping it");
                    return Ok(());
                }
                tokio::fs::write(&path, contents).await?;
                info!(path = %path.display(), "Wrote failure file");
            }
        }
        Ok(())
    }
}
