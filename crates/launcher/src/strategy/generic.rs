//! Generic external launcher

use std::collections::BTreeMap;

use process::{log_invocation, CommandSpec};
use runtime_core::{Error, ExecutionEnvironment, GenericLauncherOptions, Result, RunResult};
use tracing::info;

use super::LaunchContext;

/// Prefixes the entry point with a user- or framework-supplied launcher
///
/// The launcher is opaque: whatever it does with the payload, its own
/// exit status is the result.
#[derive(Debug, Clone)]
pub struct GenericLauncher {
    options: GenericLauncherOptions,
}

impl GenericLauncher {
    pub fn new(options: GenericLauncherOptions) -> Self {
        Self { options }
    }

    /// Launcher argv followed by the entry point payload
    pub fn command(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> Result<CommandSpec> {
        if self.options.command.is_empty() {
            return Err(Error::InvalidConfig {
                message: "generic launcher command is empty".to_string(),
            });
        }
        let entry = ctx.builder.entry_command(env)?;

        let mut argv = self.options.command.clone();
        argv.extend(entry.launcher_payload(self.options.include_interpreter));
        ctx.builder.spec(env, argv)
    }

    pub async fn launch(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> RunResult {
        match self.command(ctx, env) {
            Ok(spec) => run_wrapped(ctx, env, spec, BTreeMap::new()).await,
            Err(e) => RunResult::from_error(&e),
        }
    }
}

/// Run a launcher command once with extra environment variables
pub(crate) async fn run_wrapped(
    ctx: &LaunchContext,
    env: &ExecutionEnvironment,
    mut spec: CommandSpec,
    extra_env: BTreeMap<String, String>,
) -> RunResult {
    spec.env.extend(extra_env);
    log_invocation(&spec, env);
    info!(launcher = %spec.program, "Running entry point through external launcher");

    ctx.supervisor.run_until_shutdown(&spec, true, &ctx.shutdown).await
}
