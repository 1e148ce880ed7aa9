//! Core type definitions for the training launcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::config::duration_ms;
use crate::error::DEFAULT_FAILURE_CODE;
use crate::host::{elect_leader, HostRole};
use crate::{Error, Result};

/// Unique identifier types
pub type HostId = String;
pub type RunId = Uuid;

/// Per-host resource counts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostResources {
    /// Number of CPUs
    pub num_cpus: usize,

    /// Number of GPUs
    pub num_gpus: usize,

    /// Number of Neuron accelerator cores
    pub num_neurons: usize,
}

/// EFA interconnect toggles
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EfaOptions {
    /// Route NCCL traffic through the EFA libfabric provider
    pub enable_efa: bool,

    /// Use EFA device RDMA for one- and two-sided transfers
    pub enable_rdma: bool,
}

/// Plain multi-process options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlainOptions {
    /// Local copies of the entry point started on each host
    pub processes_per_host: usize,
}

impl Default for PlainOptions {
    fn default() -> Self {
        Self {
            processes_per_host: 1,
        }
    }
}

/// MPI options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MpiOptions {
    /// Ranks per host; defaults to the GPU count (1 on CPU hosts)
    pub processes_per_host: Option<usize>,

    /// Total ranks; defaults to `processes_per_host * hosts`
    pub num_processes: Option<usize>,

    /// Extra orchestrator options, whitespace separated
    pub custom_mpi_options: String,

    /// Port of the SSH daemon the orchestrator spawns ranks through
    pub ssh_port: u16,
}

impl Default for MpiOptions {
    fn default() -> Self {
        Self {
            processes_per_host: None,
            num_processes: None,
            custom_mpi_options: String::new(),
            ssh_port: 22,
        }
    }
}

/// torchrun options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TorchDistributedOptions {
    /// Workers per node; defaults to the GPU count (1 on CPU hosts)
    pub processes_per_host: Option<usize>,

    /// Port of the rendezvous store on the leader
    pub master_port: u16,

    /// Interconnect toggles
    pub efa: EfaOptions,
}

impl Default for TorchDistributedOptions {
    fn default() -> Self {
        Self {
            processes_per_host: None,
            master_port: 7777,
            efa: EfaOptions::default(),
        }
    }
}

/// Generic external launcher options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenericLauncherOptions {
    /// Launcher argv placed before the entry point command
    pub command: Vec<String>,

    /// Keep the python interpreter in the payload
    pub include_interpreter: bool,
}

/// SMDDP options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SmdataparallelOptions {
    /// Ranks per host; defaults to the GPU count (1 on CPU hosts)
    pub processes_per_host: Option<usize>,

    /// Extra orchestrator options, whitespace separated
    pub custom_mpi_options: String,

    /// Port of the SMDDP server on the leader
    pub server_port: u16,

    /// Port of the SSH daemon the orchestrator spawns ranks through
    pub ssh_port: u16,

    /// Interconnect toggles
    pub efa: EfaOptions,
}

impl Default for SmdataparallelOptions {
    fn default() -> Self {
        Self {
            processes_per_host: None,
            custom_mpi_options: String::new(),
            server_port: 7592,
            ssh_port: 22,
            efa: EfaOptions::default(),
        }
    }
}

/// Distribution configuration; exactly one mode is active per run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DistributionConfig {
    /// Plain local processes on every host
    #[serde(rename = "none", alias = "plain")]
    Plain(PlainOptions),

    /// MPI orchestrated by the leader
    Mpi(MpiOptions),

    /// torchrun on every host
    TorchDistributed(TorchDistributedOptions),

    /// User- or framework-specified launcher on every host
    GenericLauncher(GenericLauncherOptions),

    /// SMDDP over MPI, orchestrated by the leader
    Smdataparallel(SmdataparallelOptions),
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig::Plain(PlainOptions::default())
    }
}

impl DistributionConfig {
    /// Short mode name used in logs and error messages
    pub fn mode_name(&self) -> &'static str {
        match self {
            DistributionConfig::Plain(_) => "none",
            DistributionConfig::Mpi(_) => "mpi",
            DistributionConfig::TorchDistributed(_) => "torch_distributed",
            DistributionConfig::GenericLauncher(_) => "generic_launcher",
            DistributionConfig::Smdataparallel(_) => "smdataparallel",
        }
    }
}

/// Immutable execution environment snapshot for one training invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    /// Identifier of the host this process runs on
    pub current_host: HostId,

    /// All hosts of the cluster
    pub hosts: Vec<HostId>,

    /// Resource counts of each host
    #[serde(default)]
    pub resources: HostResources,

    /// Interface carrying inter-host traffic
    #[serde(default = "default_network_interface")]
    pub network_interface_name: String,

    /// Instance type of the current host
    #[serde(default)]
    pub instance_type: Option<String>,

    /// Entry point file name, relative to `code_dir`
    pub entry_point: String,

    /// Directory holding the user code; also the working directory
    #[serde(default = "default_code_dir")]
    pub code_dir: PathBuf,

    /// Resolved entry point arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Resolved entry point environment variables
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    /// Distribution mode
    #[serde(default)]
    pub distribution: DistributionConfig,

    /// Override of the rendezvous timeout budget
    #[serde(default, with = "duration_ms::option")]
    pub rendezvous_timeout: Option<Duration>,
}

fn default_network_interface() -> String {
    "eth0".to_string()
}

fn default_code_dir() -> PathBuf {
    PathBuf::from("/opt/ml/code")
}

impl ExecutionEnvironment {
    /// Create a single-host snapshot with defaults for everything else
    pub fn single_host(
        host: impl Into<HostId>,
        entry_point: impl Into<String>,
        code_dir: impl Into<PathBuf>,
    ) -> Self {
        let host = host.into();
        Self {
            current_host: host.clone(),
            hosts: vec![host],
            resources: HostResources::default(),
            network_interface_name: default_network_interface(),
            instance_type: None,
            entry_point: entry_point.into(),
            code_dir: code_dir.into(),
            args: Vec::new(),
            env_vars: BTreeMap::new(),
            distribution: DistributionConfig::default(),
            rendezvous_timeout: None,
        }
    }

    /// Load and validate a snapshot from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let env: Self = serde_json::from_str(&raw)?;
        env.validate()?;
        Ok(env)
    }

    /// Check the invariants every strategy relies on
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::InvalidConfig {
                message: "host list is empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.hosts.iter().find(|h| !seen.insert(h.as_str())) {
            return Err(Error::InvalidConfig {
                message: format!("duplicate host: {}", dup),
            });
        }

        if !self.hosts.contains(&self.current_host) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "current host {} is not part of the host list",
                    self.current_host
                ),
            });
        }

        if self.entry_point.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "entry point is empty".to_string(),
            });
        }

        Ok(())
    }

    /// Hosts in lexicographic order; every host computes the same list
    pub fn sorted_hosts(&self) -> Vec<HostId> {
        let mut hosts = self.hosts.clone();
        hosts.sort();
        hosts
    }

    /// True when more than one host takes part in the run
    pub fn is_distributed(&self) -> bool {
        self.hosts.len() > 1
    }

    /// Leader host of the run
    pub fn leader(&self) -> &str {
        elect_leader(&self.hosts).unwrap_or(self.current_host.as_str())
    }

    /// Role of the current host
    pub fn role(&self) -> HostRole {
        HostRole::for_host(&self.current_host, &self.hosts)
    }

    /// Position of the current host in the sorted host list
    pub fn host_rank(&self) -> usize {
        self.sorted_hosts()
            .iter()
            .position(|h| *h == self.current_host)
            .unwrap_or(0)
    }

    /// Processes per host used when a mode leaves it unset
    pub fn default_processes_per_host(&self) -> usize {
        if self.resources.num_gpus > 0 {
            self.resources.num_gpus
        } else {
            1
        }
    }

    /// Resolved processes per host for the active distribution mode
    pub fn processes_per_host(&self) -> usize {
        let explicit = match &self.distribution {
            DistributionConfig::Plain(opts) => Some(opts.processes_per_host),
            DistributionConfig::Mpi(opts) => opts.processes_per_host,
            DistributionConfig::TorchDistributed(opts) => opts.processes_per_host,
            DistributionConfig::GenericLauncher(_) => Some(1),
            DistributionConfig::Smdataparallel(opts) => opts.processes_per_host,
        };
        explicit
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.default_processes_per_host())
    }
}

/// Failure details of a process or distributed run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    /// Exit code of the failed process
    pub exit_code: i32,

    /// Tail of stderr, or the supervising error when stderr had nothing
    pub message: String,

    /// Process was killed by the out-of-memory reaper
    pub aborted_due_to_oom: bool,

    /// First configured error signature found in the stderr tail
    pub error_class: Option<String>,

    /// Rendered command line of the failed process
    pub command: Option<String>,
}

impl Failure {
    /// Create a failure with a message
    pub fn new(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
            aborted_due_to_oom: false,
            error_class: None,
            command: None,
        }
    }

    /// Create an out-of-memory failure
    pub fn out_of_memory(exit_code: i32) -> Self {
        Self {
            aborted_due_to_oom: true,
            ..Self::new(exit_code, "out of memory")
        }
    }

    /// Attach the rendered command line
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Attach the matched error signature
    pub fn with_error_class(mut self, error_class: Option<String>) -> Self {
        self.error_class = error_class;
        self
    }
}

/// Outcome of one process or one distributed run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    /// Exited with status 0
    Success,

    /// Anything else
    Failure(Failure),
}

impl RunResult {
    /// Returns true for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success)
    }

    /// Failure details, if any
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            RunResult::Success => None,
            RunResult::Failure(f) => Some(f),
        }
    }

    /// Exit code to report: 0 on success
    pub fn exit_code(&self) -> i32 {
        self.failure().map_or(0, |f| f.exit_code)
    }

    /// Result for an error raised before or around the process
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::OutOfMemory { exit_code } => {
                RunResult::Failure(Failure::out_of_memory(*exit_code))
            }
            Error::ProcessFailure { exit_code, message } => {
                RunResult::Failure(Failure::new(*exit_code, message.clone()))
            }
            other => RunResult::Failure(Failure::new(
                other.exit_code().max(DEFAULT_FAILURE_CODE),
                other.to_string(),
            )),
        }
    }

    /// Convert into the error taxonomy
    pub fn into_result(self) -> Result<()> {
        match self {
            RunResult::Success => Ok(()),
            RunResult::Failure(f) if f.aborted_due_to_oom => Err(Error::OutOfMemory {
                exit_code: f.exit_code,
            }),
            RunResult::Failure(f) => Err(Error::ProcessFailure {
                exit_code: f.exit_code,
                message: f.message,
            }),
        }
    }
}

impl From<Error> for RunResult {
    fn from(error: Error) -> Self {
        RunResult::from_error(&error)
    }
}

/// Summary of one training invocation on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Identifier correlating the log lines of this invocation
    pub run_id: RunId,

    /// Host the run executed on
    pub host: HostId,

    /// Timestamp when the run started
    pub started_at: DateTime<Utc>,

    /// Timestamp when the run finished
    pub finished_at: DateTime<Utc>,

    /// Terminal result
    pub result: RunResult,
}

impl RunReport {
    /// Close a run that started at `started_at`
    pub fn finish(run_id: RunId, host: HostId, started_at: DateTime<Utc>, result: RunResult) -> Self {
        Self {
            run_id,
            host,
            started_at,
            finished_at: Utc::now(),
            result,
        }
    }

    /// Wall-clock duration of the run
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
