//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Process supervisor settings
    pub supervisor: SupervisorConfig,

    /// Rendezvous settings
    pub rendezvous: RendezvousConfig,

    /// Launch strategy settings
    pub launch: LaunchConfig,

    /// MPI leader/worker settings
    pub mpi: MpiConfig,

    /// Outcome reporter settings
    pub reporter: ReporterConfig,
}

impl RuntimeConfig {
    /// Load a configuration from a JSON file; missing sections take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Process supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interpreter used for python entry points
    pub python_executable: String,

    /// Shell used for command entry points
    pub shell: String,

    /// Number of trailing stderr lines kept for failure diagnosis
    pub stderr_tail_lines: usize,

    /// Upper bound on the bytes held by the stderr tail
    pub stderr_tail_bytes: usize,

    /// Longest output line forwarded as one line; the rest is cut off
    pub max_line_bytes: usize,

    /// How long output is still drained after the process exits, for
    /// descendants that keep the pipes open
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,

    /// Out-of-memory classification
    pub oom: OomPolicy,

    /// Substrings searched in the stderr tail of a failed process
    pub error_signatures: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            python_executable: "python".to_string(),
            shell: "/bin/sh".to_string(),
            stderr_tail_lines: 1000,
            stderr_tail_bytes: 64 * 1024,
            max_line_bytes: 16 * 1024,
            drain_timeout: Duration::from_secs(5),
            oom: OomPolicy::default(),
            error_signatures: Vec::new(),
        }
    }
}

/// Predicate deciding whether a process was killed by the OOM reaper
///
/// The kernel reaper delivers SIGKILL; shells and container runtimes
/// report that as exit code 137. Neither is a portable contract, so both
/// lists are configurable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OomPolicy {
    /// Terminating signals treated as OOM kills
    pub signals: Vec<i32>,

    /// Exit codes treated as OOM kills
    pub exit_codes: Vec<i32>,
}

impl Default for OomPolicy {
    fn default() -> Self {
        Self {
            signals: vec![9],
            exit_codes: vec![137],
        }
    }
}

impl OomPolicy {
    /// Policy that never classifies an exit as OOM
    pub fn disabled() -> Self {
        Self {
            signals: Vec::new(),
            exit_codes: Vec::new(),
        }
    }

    /// Classify an exit given its code (if any) and terminating signal (if any)
    pub fn is_oom(&self, code: Option<i32>, signal: Option<i32>) -> bool {
        if let Some(signal) = signal {
            if self.signals.contains(&signal) {
                return true;
            }
        }
        code.is_some_and(|c| self.exit_codes.contains(&c))
    }
}

/// Rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Overall budget for all hosts to become reachable
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Delay between probe rounds
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Timeout of a single connection attempt
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// How hosts are probed during the initial rendezvous
    pub probe: ProbeMode,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            probe: ProbeMode::Resolve,
        }
    }
}

/// Reachability probe selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeMode {
    /// Name resolution only
    #[default]
    Resolve,

    /// Name resolution followed by a TCP connect to `port`
    Connect { port: u16 },
}

/// Launch strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Terminate remaining local processes once one of them fails
    pub abort_siblings_on_failure: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            abort_siblings_on_failure: true,
        }
    }
}

/// MPI leader/worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpiConfig {
    /// MPI orchestrator executable
    pub mpirun: String,

    /// SMDDP launcher inserted before the payload
    pub smddprun: String,

    /// SSH daemon executable, run with `-D`
    pub sshd: PathBuf,

    /// SSH client used to signal workers
    pub ssh: String,

    /// File the worker appends its environment to, so remote MPI ranks see it
    pub environment_file: Option<PathBuf>,

    /// Library exported as `LD_PRELOAD` to remote ranks
    pub ld_preload: Option<String>,

    /// Environment variables forwarded to remote ranks when present
    pub credentials: Vec<String>,

    /// Name of the per-host MPI daemon process watched by workers
    pub orted_process_name: String,

    /// How long a worker waits for the MPI daemon to appear
    #[serde(with = "duration_ms")]
    pub orted_start_timeout: Duration,

    /// Interval of the worker's job-completion checks
    #[serde(with = "duration_ms")]
    pub job_poll_interval: Duration,

    /// Prefix of the status file announcing job completion to workers
    pub status_file_prefix: String,

    /// Attempts made by the leader to write the status file on a worker
    pub status_file_attempts: u32,

    /// Delay between two status file attempts on the same worker
    #[serde(with = "duration_ms")]
    pub status_file_retry_interval: Duration,

    /// Delay after job completion before the worker tears down its daemon
    #[serde(with = "duration_ms")]
    pub finish_grace: Duration,
}

impl Default for MpiConfig {
    fn default() -> Self {
        Self {
            mpirun: "mpirun".to_string(),
            smddprun: "smddprun".to_string(),
            sshd: PathBuf::from("/usr/sbin/sshd"),
            ssh: "ssh".to_string(),
            environment_file: Some(PathBuf::from("/etc/environment")),
            ld_preload: None,
            credentials: vec![
                "AWS_ACCESS_KEY_ID".to_string(),
                "AWS_SECRET_ACCESS_KEY".to_string(),
                "AWS_SESSION_TOKEN".to_string(),
            ],
            orted_process_name: "orted".to_string(),
            orted_start_timeout: Duration::from_secs(5 * 60),
            job_poll_interval: Duration::from_secs(1),
            status_file_prefix: "/tmp/done".to_string(),
            status_file_attempts: 6,
            status_file_retry_interval: Duration::from_secs(1),
            finish_grace: Duration::from_secs(30),
        }
    }
}

/// Outcome reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Directory receiving the `success`/`failure` sentinel files
    pub output_dir: PathBuf,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/opt/ml/output"),
        }
    }
}

/// Duration serialization helper for human-readable formats
pub(crate) mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    /// Same encoding for optional durations
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
