//! torchrun launch

use std::collections::BTreeMap;

use process::{CommandSpec, EntryPointKind};
use runtime_core::{Error, ExecutionEnvironment, Result, RunResult, TorchDistributedOptions};
use tracing::info;

use super::generic::run_wrapped;
use super::LaunchContext;

/// Elastic launcher module name
const TORCHRUN: &str = "torchrun";

/// Runs `torchrun` on every host; torchrun spawns the local workers
#[derive(Debug, Clone)]
pub struct TorchDistributedLauncher {
    options: TorchDistributedOptions,
    processes_per_host: usize,
}

impl TorchDistributedLauncher {
    pub fn new(options: TorchDistributedOptions, processes_per_host: usize) -> Self {
        Self {
            options,
            processes_per_host,
        }
    }

    /// torchrun argv for the current host
    ///
    /// Only python programs can be handed to torchrun.
    pub fn command(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> Result<CommandSpec> {
        let entry = ctx.builder.entry_command(env)?;
        match entry.kind {
            EntryPointKind::PythonProgram => {}
            EntryPointKind::PythonPackage => {
                return Err(Error::UnsupportedEntryPoint {
                    mode: "torch_distributed".to_string(),
                    reason: "python packages are not supported, use a python script".to_string(),
                })
            }
            EntryPointKind::Command => {
                return Err(Error::UnsupportedEntryPoint {
                    mode: "torch_distributed".to_string(),
                    reason: format!("{} is not a python script", entry.entry_point),
                })
            }
        }

        let num_hosts = env.hosts.len();
        let mut argv = vec![
            TORCHRUN.to_string(),
            "--nnodes".to_string(),
            num_hosts.to_string(),
            "--nproc_per_node".to_string(),
            self.processes_per_host.to_string(),
        ];
        if num_hosts > 1 {
            argv.extend([
                "--master_addr".to_string(),
                env.leader().to_string(),
                "--master_port".to_string(),
                self.options.master_port.to_string(),
                "--node_rank".to_string(),
                env.host_rank().to_string(),
            ]);
        }
        argv.extend(entry.launcher_payload(false));

        info!(
            nnodes = num_hosts,
            nproc_per_node = self.processes_per_host,
            node_rank = env.host_rank(),
            "Built torchrun command"
        );
        ctx.builder.spec(env, argv)
    }

    /// Interconnect variables exported to torchrun and its workers
    pub fn interconnect_env(&self, env: &ExecutionEnvironment) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if self.options.efa.enable_efa {
            vars.insert("FI_PROVIDER".to_string(), "efa".to_string());
        }
        if self.options.efa.enable_rdma {
            vars.insert("FI_EFA_USE_DEVICE_RDMA".to_string(), "1".to_string());
        }
        vars.insert(
            "NCCL_SOCKET_IFNAME".to_string(),
            env.network_interface_name.clone(),
        );
        vars
    }

    pub async fn launch(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> RunResult {
        match self.command(ctx, env) {
            Ok(spec) => run_wrapped(ctx, env, spec, self.interconnect_env(env)).await,
            Err(e) => RunResult::from_error(&e),
        }
    }
}
