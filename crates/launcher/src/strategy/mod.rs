//! Distributed launch strategies
//!
//! Exactly one strategy is selected per run from the distribution mode
//! of the execution environment.

mod generic;
mod mpi;
mod plain;
mod torch;

pub use generic::GenericLauncher;
pub use mpi::{parse_custom_mpi_options, CustomMpiOptions, MpiFlavor, MpiLauncher};
pub use plain::PlainLauncher;
pub use torch::TorchDistributedLauncher;

use std::sync::Arc;

use process::{CommandBuilder, ProcessSupervisor, SinkHandle};
use runtime_core::{
    CancellationToken, DistributionConfig, ExecutionEnvironment, RunResult, RuntimeConfig,
};

/// Everything a strategy needs besides the environment snapshot
#[derive(Clone)]
pub struct LaunchContext {
    /// Runtime configuration
    pub config: Arc<RuntimeConfig>,

    /// Entry point command builder
    pub builder: CommandBuilder,

    /// Supervisor for every process the strategy starts
    pub supervisor: ProcessSupervisor,

    /// Cancelled when the invocation must stop
    pub shutdown: CancellationToken,
}

impl LaunchContext {
    /// Create a context inheriting the launcher's own environment
    pub fn new(config: RuntimeConfig, sink: SinkHandle, shutdown: CancellationToken) -> Self {
        Self {
            builder: CommandBuilder::new(&config.supervisor),
            supervisor: ProcessSupervisor::new(config.supervisor.clone(), sink),
            config: Arc::new(config),
            shutdown,
        }
    }

    /// Replace the command builder
    pub fn with_builder(mut self, builder: CommandBuilder) -> Self {
        self.builder = builder;
        self
    }
}

/// The launch strategy of one run
#[derive(Debug, Clone)]
pub enum DistributedLauncher {
    Plain(PlainLauncher),
    Mpi(MpiLauncher),
    TorchDistributed(TorchDistributedLauncher),
    Generic(GenericLauncher),
}

impl DistributedLauncher {
    /// Select the strategy for `env`
    pub fn for_environment(env: &ExecutionEnvironment) -> Self {
        let processes_per_host = env.processes_per_host();
        match &env.distribution {
            DistributionConfig::Plain(_) => {
                DistributedLauncher::Plain(PlainLauncher::new(processes_per_host))
            }
            DistributionConfig::Mpi(opts) => {
                DistributedLauncher::Mpi(MpiLauncher::mpi(opts, processes_per_host))
            }
            DistributionConfig::Smdataparallel(opts) => {
                DistributedLauncher::Mpi(MpiLauncher::smdataparallel(opts, processes_per_host))
            }
            DistributionConfig::TorchDistributed(opts) => DistributedLauncher::TorchDistributed(
                TorchDistributedLauncher::new(opts.clone(), processes_per_host),
            ),
            DistributionConfig::GenericLauncher(opts) => {
                DistributedLauncher::Generic(GenericLauncher::new(opts.clone()))
            }
        }
    }

    /// Strategy name for logs
    pub fn name(&self) -> &'static str {
        match self {
            DistributedLauncher::Plain(_) => "plain",
            DistributedLauncher::Mpi(l) => l.flavor().name(),
            DistributedLauncher::TorchDistributed(_) => "torch_distributed",
            DistributedLauncher::Generic(_) => "generic_launcher",
        }
    }

    /// Run the strategy to completion on the current host
    pub async fn launch(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> RunResult {
        match self {
            DistributedLauncher::Plain(l) => l.launch(ctx, env).await,
            DistributedLauncher::Mpi(l) => l.launch(ctx, env).await,
            DistributedLauncher::TorchDistributed(l) => l.launch(ctx, env).await,
            DistributedLauncher::Generic(l) => l.launch(ctx, env).await,
        }
    }
}
