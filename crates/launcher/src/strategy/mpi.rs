//! MPI-orchestrated launch
//!
//! The leader starts an SSH daemon, waits for every worker's daemon and
//! runs the orchestrator (`mpirun`), which spawns all ranks over SSH. A
//! worker only hosts an SSH daemon and blocks until the job is over: the
//! per-host MPI daemon (`orted`) appearing and exiting again, or a status
//! file written by the leader.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use process::{log_invocation, CommandSpec, EntryCommand, RunHandle};
use rendezvous::{ConnectProbe, RendezvousCoordinator};
use runtime_core::config::MpiConfig;
use runtime_core::{
    EfaOptions, Error, ExecutionEnvironment, Failure, HostId, MpiOptions, Result, RunResult,
    SmdataparallelOptions,
};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::LaunchContext;

/// Exit code reported when the worker never saw the MPI daemon
const ORTED_MISSING_EXIT_CODE: i32 = 1;

/// Which orchestrator command line is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpiFlavor {
    /// Plain `mpirun`
    Mpi,

    /// `mpirun … smddprun` for SMDDP
    Smdataparallel,
}

impl MpiFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            MpiFlavor::Mpi => "mpi",
            MpiFlavor::Smdataparallel => "smdataparallel",
        }
    }
}

/// User orchestrator options split into known overrides and the rest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMpiOptions {
    /// `NCCL_DEBUG` level exported to all ranks
    pub nccl_debug: String,

    /// Everything else, appended verbatim
    pub additional: Vec<String>,
}

/// Split custom options on whitespace, pulling out `--NCCL_DEBUG`
pub fn parse_custom_mpi_options(options: &str) -> CustomMpiOptions {
    let mut parsed = CustomMpiOptions {
        nccl_debug: "INFO".to_string(),
        additional: Vec::new(),
    };

    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        if let Some(value) = token.strip_prefix("--NCCL_DEBUG=") {
            parsed.nccl_debug = value.to_string();
        } else if token == "--NCCL_DEBUG" {
            match tokens.next() {
                Some(value) => parsed.nccl_debug = value.to_string(),
                None => parsed.additional.push(token.to_string()),
            }
        } else {
            parsed.additional.push(token.to_string());
        }
    }
    parsed
}

/// How a worker learned that the job is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobCompletion {
    /// The MPI daemon appeared and exited again
    OrtedExited,

    /// The leader wrote the status file
    StatusFile,

    /// The MPI daemon never appeared
    OrtedNeverStarted,
}

/// MPI leader/worker strategy
#[derive(Debug, Clone)]
pub struct MpiLauncher {
    flavor: MpiFlavor,
    processes_per_host: usize,
    num_processes: Option<usize>,
    custom_mpi_options: String,
    ssh_port: u16,
    server_port: u16,
    efa: EfaOptions,
}

impl MpiLauncher {
    /// Plain MPI
    pub fn mpi(opts: &MpiOptions, processes_per_host: usize) -> Self {
        Self {
            flavor: MpiFlavor::Mpi,
            processes_per_host,
            num_processes: opts.num_processes,
            custom_mpi_options: opts.custom_mpi_options.clone(),
            ssh_port: opts.ssh_port,
            server_port: 0,
            efa: EfaOptions::default(),
        }
    }

    /// SMDDP over MPI
    pub fn smdataparallel(opts: &SmdataparallelOptions, processes_per_host: usize) -> Self {
        Self {
            flavor: MpiFlavor::Smdataparallel,
            processes_per_host,
            num_processes: None,
            custom_mpi_options: opts.custom_mpi_options.clone(),
            ssh_port: opts.ssh_port,
            server_port: opts.server_port,
            efa: opts.efa,
        }
    }

    pub fn flavor(&self) -> MpiFlavor {
        self.flavor
    }

    /// Total number of ranks
    pub fn num_processes(&self, num_hosts: usize) -> usize {
        match self.flavor {
            MpiFlavor::Mpi => self
                .num_processes
                .unwrap_or(self.processes_per_host * num_hosts),
            MpiFlavor::Smdataparallel => self.processes_per_host * num_hosts,
        }
    }

    /// Run the leader or worker side, depending on the current host
    pub async fn launch(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> RunResult {
        let role = env.role();
        info!(flavor = self.flavor.name(), role = %role, "Starting MPI run");

        let result = if role.is_leader() {
            self.run_leader(ctx, env).await
        } else {
            self.run_worker(ctx, env).await
        };
        result.unwrap_or_else(|e| RunResult::from_error(&e))
    }

    /// Orchestrator argv without the payload
    pub fn orchestrator_command(
        &self,
        env: &ExecutionEnvironment,
        config: &MpiConfig,
        script_env: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let hosts = env.sorted_hosts();
        let num_hosts = hosts.len();
        let interface = env.network_interface_name.as_str();
        let custom = parse_custom_mpi_options(&self.custom_mpi_options);

        let host_list = match self.flavor {
            MpiFlavor::Mpi if self.processes_per_host == 1 => hosts.join(","),
            MpiFlavor::Smdataparallel if num_hosts == 1 => hosts.join(","),
            _ => hosts
                .iter()
                .map(|h| format!("{}:{}", h, self.processes_per_host))
                .collect::<Vec<_>>()
                .join(","),
        };

        let mut cmd = vec![
            config.mpirun.clone(),
            "--host".to_string(),
            host_list,
            "-np".to_string(),
            self.num_processes(num_hosts).to_string(),
            "--allow-run-as-root".to_string(),
        ];
        match self.flavor {
            MpiFlavor::Mpi => cmd.extend(strings(&["--display-map", "--tag-output"])),
            MpiFlavor::Smdataparallel => cmd.extend(strings(&["--tag-output", "--oversubscribe"])),
        }
        cmd.extend(strings(&["-mca", "btl_tcp_if_include", interface]));
        cmd.extend(strings(&["-mca", "oob_tcp_if_include", interface]));
        cmd.extend(strings(&["-mca", "plm_rsh_no_tree_spawn", "1"]));
        if self.flavor == MpiFlavor::Mpi {
            cmd.extend(strings(&["-bind-to", "none", "-map-by", "slot"]));
        }
        cmd.extend(strings(&["-mca", "pml", "ob1"]));
        cmd.extend(strings(&["-mca", "btl", "^openib"]));
        cmd.extend(strings(&["-mca", "orte_abort_on_non_zero_status", "1"]));
        cmd.extend(strings(&["-mca", "btl_vader_single_copy_mechanism", "none"]));

        match self.flavor {
            MpiFlavor::Mpi => {
                export(&mut cmd, "NCCL_MIN_NRINGS=4");
                export(&mut cmd, format!("NCCL_SOCKET_IFNAME={}", interface));
                export(&mut cmd, format!("NCCL_DEBUG={}", custom.nccl_debug));
                export(&mut cmd, "LD_LIBRARY_PATH");
                export(&mut cmd, "PATH");
                if let Some(preload) = &config.ld_preload {
                    export(&mut cmd, format!("LD_PRELOAD={}", preload));
                }
                cmd.extend(custom.additional);

                for credential in &config.credentials {
                    if script_env.contains_key(credential) {
                        export(&mut cmd, credential.as_str());
                    }
                }
                for name in env.env_vars.keys() {
                    export(&mut cmd, name.as_str());
                }
            }
            MpiFlavor::Smdataparallel => {
                cmd.extend(strings(&["-mca", "plm_rsh_num_concurrent"]));
                cmd.push(num_hosts.to_string());
                export(&mut cmd, format!("NCCL_SOCKET_IFNAME={}", interface));
                export(&mut cmd, format!("NCCL_DEBUG={}", custom.nccl_debug));
                export(&mut cmd, "LD_LIBRARY_PATH");
                export(&mut cmd, "PATH");
                if num_hosts > 1 {
                    export(&mut cmd, "SMDATAPARALLEL_USE_HOMOGENEOUS=1");
                } else {
                    export(&mut cmd, "SMDATAPARALLEL_USE_SINGLENODE=1");
                }
                export(&mut cmd, "FI_PROVIDER=efa");
                export(&mut cmd, "RDMAV_FORK_SAFE=1");
                if let Some(preload) = &config.ld_preload {
                    export(&mut cmd, format!("LD_PRELOAD={}", preload));
                }
                cmd.extend(custom.additional);

                if self.efa.enable_efa {
                    export(&mut cmd, "NCCL_PROTO=simple");
                }
                if self.efa.enable_rdma {
                    export(&mut cmd, "FI_EFA_USE_DEVICE_RDMA=1");
                }
                if num_hosts > 1 {
                    export(&mut cmd, format!("SMDATAPARALLEL_SERVER_ADDR={}", env.leader()));
                    export(&mut cmd, format!("SMDATAPARALLEL_SERVER_PORT={}", self.server_port));
                    if let Some(instance_type) = &env.instance_type {
                        export(&mut cmd, format!("SAGEMAKER_INSTANCE_TYPE={}", instance_type));
                    }
                }
                cmd.push(config.smddprun.clone());
            }
        }
        cmd
    }

    /// Entry point wrapped so an uncaught python exception aborts all ranks
    pub fn payload(&self, entry: EntryCommand) -> Vec<String> {
        let mut interpreter = entry.interpreter.clone();
        interpreter.extend(strings(&["-m", "mpi4py"]));
        entry.with_interpreter(interpreter).argv()
    }

    /// Full leader command: orchestrator followed by the payload
    pub fn leader_command(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> Result<CommandSpec> {
        let entry = ctx.builder.entry_command(env)?;
        let script_env = ctx.builder.environment(env);

        let mut argv = self.orchestrator_command(env, &ctx.config.mpi, &script_env);
        argv.extend(self.payload(entry));

        info!(
            hosts = ?env.sorted_hosts(),
            processes_per_host = self.processes_per_host,
            num_processes = self.num_processes(env.hosts.len()),
            interface = %env.network_interface_name,
            "Built MPI command"
        );
        Ok(ctx.builder.spec(env, argv)?.label(self.flavor.name()))
    }

    async fn run_leader(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> Result<RunResult> {
        let spec = self.leader_command(ctx, env)?;

        // Keeps the daemon alive for the whole job
        let sshd = if env.is_distributed() {
            Some(start_sshd(ctx, &ctx.config.mpi)?)
        } else {
            None
        };
        let result = self.run_job(ctx, env, &spec).await;

        if let Some(handle) = sshd {
            stop_daemon(handle).await;
        }
        result
    }

    async fn run_job(
        &self,
        ctx: &LaunchContext,
        env: &ExecutionEnvironment,
        spec: &CommandSpec,
    ) -> Result<RunResult> {
        if env.is_distributed() {
            let workers: Vec<HostId> = env
                .sorted_hosts()
                .into_iter()
                .filter(|h| *h != env.current_host)
                .collect();
            info!(workers = ?workers, "Waiting for MPI workers to accept SSH connections");
            self.wait_for_ssh(ctx, env, &workers).await?;
        }

        log_invocation(spec, env);
        let result = ctx.supervisor.run_until_shutdown(spec, true, &ctx.shutdown).await;

        if self.flavor == MpiFlavor::Smdataparallel && env.is_distributed() {
            self.notify_workers(ctx, env).await;
        }
        Ok(result)
    }

    async fn run_worker(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> Result<RunResult> {
        let mpi = &ctx.config.mpi;
        let leader = env.leader().to_string();

        check_daemon(&mpi.sshd)?;
        info!(leader = %leader, "Waiting for MPI leader to start its SSH daemon");
        self.wait_for_ssh(ctx, env, std::slice::from_ref(&leader)).await?;

        if let Some(path) = &mpi.environment_file {
            write_environment_file(path, &ctx.builder.environment(env)).await?;
        }
        clear_status_file(mpi, &leader).await?;

        // Cancelled once the job is over, and with the launcher's shutdown
        let stop = ctx.shutdown.child_token();
        let handle = start_sshd(ctx, mpi)?;
        let daemon = handle.wait_or_shutdown(&stop);
        tokio::pin!(daemon);

        let result = tokio::select! {
            result = &mut daemon => {
                if ctx.shutdown.is_cancelled() {
                    info!("SSH daemon stopped on launcher shutdown");
                } else {
                    warn!("SSH daemon exited before the MPI job finished");
                }
                result
            }
            completion = wait_for_job(mpi, &leader) => {
                let result = match completion {
                    JobCompletion::OrtedNeverStarted => {
                        let message = format!(
                            "MPI daemon {} did not start within {}s",
                            mpi.orted_process_name,
                            mpi.orted_start_timeout.as_secs()
                        );
                        warn!("{}", message);
                        RunResult::Failure(Failure::new(ORTED_MISSING_EXIT_CODE, message))
                    }
                    done => {
                        info!(completion = ?done, "MPI job finished");
                        tokio::time::sleep(mpi.finish_grace).await;
                        RunResult::Success
                    }
                };
                stop.cancel();
                let _ = (&mut daemon).await;
                result
            }
        };
        Ok(result)
    }

    /// Wait until `hosts` accept SSH connections, or until shutdown
    async fn wait_for_ssh(
        &self,
        ctx: &LaunchContext,
        env: &ExecutionEnvironment,
        hosts: &[HostId],
    ) -> Result<()> {
        let rendezvous = &ctx.config.rendezvous;
        let probe = Arc::new(ConnectProbe::new(self.ssh_port, rendezvous.connect_timeout));
        let coordinator = RendezvousCoordinator::new(rendezvous, probe)
            .with_timeout(env.rendezvous_timeout.unwrap_or(rendezvous.timeout));

        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => Err(Error::ShutdownRequested {
                phase: "SSH rendezvous".to_string(),
            }),
            outcome = coordinator.wait_for_hosts(hosts, &env.current_host) => {
                outcome?;
                Ok(())
            }
        }
    }

    /// Write the status file on every worker so it stops waiting
    ///
    /// Returns the workers that acknowledged the write.
    async fn notify_workers(&self, ctx: &LaunchContext, env: &ExecutionEnvironment) -> Vec<HostId> {
        let mpi = &ctx.config.mpi;
        let leader = env.leader();
        let status_file = status_file(mpi, leader);
        let attempts = mpi.status_file_attempts.max(1);
        let mut notified = Vec::new();

        for host in env.sorted_hosts().into_iter().filter(|h| h.as_str() != leader) {
            let spec = match CommandSpec::from_argv(vec![
                mpi.ssh.clone(),
                host.clone(),
                "touch".to_string(),
                status_file.clone(),
            ]) {
                Ok(spec) => spec.label(format!("notify-{}", host)),
                Err(e) => {
                    warn!(error = %e, "Cannot build notification command");
                    return notified;
                }
            };

            let mut written = false;
            for attempt in 1..=attempts {
                if ctx.supervisor.run(&spec, false).await.is_success() {
                    written = true;
                    break;
                }
                if attempt == attempts || ctx.shutdown.is_cancelled() {
                    break;
                }
                info!(host = %host, attempt = attempt, "Retrying status file write");
                tokio::select! {
                    _ = tokio::time::sleep(mpi.status_file_retry_interval) => {}
                    _ = ctx.shutdown.cancelled() => {}
                }
            }

            if written {
                info!(host = %host, file = %status_file, "Wrote status file");
                notified.push(host);
            } else {
                warn!(host = %host, file = %status_file, "Failed to write status file");
            }
        }
        notified
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn export(cmd: &mut Vec<String>, var: impl Into<String>) {
    cmd.push("-x".to_string());
    cmd.push(var.into());
}

fn status_file(config: &MpiConfig, leader: &str) -> String {
    format!("{}.{}", config.status_file_prefix, leader)
}

fn check_daemon(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::DaemonNotFound {
            path: path.display().to_string(),
        })
    }
}

/// Remove a status file left behind by an earlier job on this host
async fn clear_status_file(config: &MpiConfig, leader: &str) -> Result<()> {
    let path = status_file(config, leader);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!(file = %path, "Removed stale status file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn stop_daemon(handle: RunHandle) {
    debug!(pid = ?handle.pid(), "Stopping SSH daemon");
    let _ = handle.terminate().await;
}

fn start_sshd(ctx: &LaunchContext, config: &MpiConfig) -> Result<RunHandle> {
    check_daemon(&config.sshd)?;
    let spec = CommandSpec::from_argv(vec![
        config.sshd.display().to_string(),
        "-D".to_string(),
    ])?
    .label("sshd");
    info!(path = %config.sshd.display(), "Starting SSH daemon");
    ctx.supervisor.spawn(&spec, true)
}

/// Append `vars` to the file remote ranks read their environment from
async fn write_environment_file(path: &Path, vars: &BTreeMap<String, String>) -> Result<()> {
    info!(path = %path.display(), "Writing environment for remote MPI ranks");
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let mut contents = String::new();
    for (key, value) in vars {
        contents.push_str(key);
        contents.push('=');
        contents.push_str(value);
        contents.push('\n');
    }
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Poll until the MPI job on this host is over
async fn wait_for_job(config: &MpiConfig, leader: &str) -> JobCompletion {
    let status_file = status_file(config, leader);
    let orted_deadline = Instant::now() + config.orted_start_timeout;
    let mut orted_seen = false;

    loop {
        if tokio::fs::try_exists(&status_file).await.unwrap_or(false) {
            return JobCompletion::StatusFile;
        }

        let running = process_running(&config.orted_process_name).await;
        if running && !orted_seen {
            info!(name = %config.orted_process_name, "MPI daemon started");
            orted_seen = true;
        } else if !running && orted_seen {
            return JobCompletion::OrtedExited;
        } else if !orted_seen && Instant::now() >= orted_deadline {
            return JobCompletion::OrtedNeverStarted;
        }

        tokio::time::sleep(config.job_poll_interval).await;
    }
}

/// True when a process named `name` is running on this host
async fn process_running(name: &str) -> bool {
    let mut entries = match tokio::fs::read_dir("/proc").await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "Cannot list processes");
            return false;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let is_pid = file_name
            .to_str()
            .is_some_and(|s| s.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        if let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await {
            if comm.trim_end() == name {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::error::SHUTDOWN_EXIT_CODE;
    use runtime_core::{CancellationToken, RuntimeConfig};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn context(config: RuntimeConfig) -> LaunchContext {
        LaunchContext::new(
            config,
            Arc::new(process::MemorySink::new()),
            CancellationToken::new(),
        )
    }

    fn three_hosts() -> ExecutionEnvironment {
        let mut env = ExecutionEnvironment::single_host("algo-1", "train.py", "/opt/ml/code");
        env.hosts = vec!["algo-3".to_string(), "algo-1".to_string(), "algo-2".to_string()];
        env
    }

    /// Stand-in SSH client that logs its arguments and fails the first
    /// `failures` calls for `flaky_host`
    fn fake_ssh(dir: &Path, flaky_host: &str, failures: u32) -> std::path::PathBuf {
        let path = dir.join("ssh");
        let body = format!(
            r#"echo "$*" >> {log}
count={dir}/count.$1
n=$(cat "$count" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$count"
if [ "$1" = "{flaky}" ] && [ "$n" -le {failures} ]; then exit 255; fi
exit 0"#,
            log = dir.join("calls").display(),
            dir = dir.display(),
            flaky = flaky_host,
            failures = failures,
        );
        script(&path, &body);
        path
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn two_hosts(processes_per_host: usize) -> ExecutionEnvironment {
        let mut env = ExecutionEnvironment::single_host("algo-1", "train.py", "/opt/ml/code");
        env.hosts = vec!["algo-2".to_string(), "algo-1".to_string()];
        env.resources.num_gpus = processes_per_host;
        env
    }

    #[test]
    fn test_parse_custom_options() {
        let parsed = parse_custom_mpi_options("--NCCL_DEBUG WARN -x FOO=1 --verbose");
        assert_eq!(parsed.nccl_debug, "WARN");
        assert_eq!(parsed.additional, vec!["-x", "FOO=1", "--verbose"]);

        let parsed = parse_custom_mpi_options("--NCCL_DEBUG=TRACE");
        assert_eq!(parsed.nccl_debug, "TRACE");
        assert!(parsed.additional.is_empty());

        let parsed = parse_custom_mpi_options("");
        assert_eq!(parsed.nccl_debug, "INFO");
    }

    #[test]
    fn test_mpi_command_single_process_per_host() {
        let env = two_hosts(1);
        let launcher = MpiLauncher::mpi(&MpiOptions::default(), 1);
        let config = MpiConfig::default();
        let cmd = launcher.orchestrator_command(&env, &config, &BTreeMap::new());

        assert_eq!(
            &cmd[..8],
            &["mpirun", "--host", "algo-1,algo-2", "-np", "2", "--allow-run-as-root", "--display-map", "--tag-output"]
        );
        let joined = cmd.join(" ");
        assert!(joined.contains("-mca btl_tcp_if_include eth0"));
        assert!(joined.contains("-x NCCL_SOCKET_IFNAME=eth0"));
        assert!(joined.contains("-x NCCL_DEBUG=INFO"));
        assert!(!joined.contains("LD_PRELOAD"));
    }

    #[test]
    fn test_mpi_command_counts_and_exports() {
        let mut env = two_hosts(4);
        env.env_vars.insert("SM_HPS".to_string(), "{}".to_string());
        let opts = MpiOptions {
            custom_mpi_options: "--NCCL_DEBUG WARN --mca btl_tcp_if_exclude lo".to_string(),
            ..Default::default()
        };
        let launcher = MpiLauncher::mpi(&opts, 4);
        let config = MpiConfig {
            ld_preload: Some("/usr/lib/libgethostname.so".to_string()),
            ..Default::default()
        };
        let script_env = BTreeMap::from([
            ("AWS_ACCESS_KEY_ID".to_string(), "key".to_string()),
            ("SM_HPS".to_string(), "{}".to_string()),
        ]);
        let cmd = launcher.orchestrator_command(&env, &config, &script_env);
        let joined = cmd.join(" ");

        assert_eq!(cmd[2], "algo-1:4,algo-2:4");
        assert_eq!(cmd[4], "8");
        assert!(joined.contains("-x NCCL_DEBUG=WARN"));
        assert!(joined.contains("-x LD_PRELOAD=/usr/lib/libgethostname.so --mca btl_tcp_if_exclude lo"));
        assert!(joined.contains("-x AWS_ACCESS_KEY_ID"));
        assert!(!joined.contains("AWS_SECRET_ACCESS_KEY"));
        assert!(joined.ends_with("-x SM_HPS"));
    }

    #[test]
    fn test_explicit_num_processes() {
        let opts = MpiOptions {
            num_processes: Some(3),
            ..Default::default()
        };
        assert_eq!(MpiLauncher::mpi(&opts, 2).num_processes(2), 3);
        assert_eq!(MpiLauncher::mpi(&MpiOptions::default(), 2).num_processes(2), 4);
    }

    #[test]
    fn test_smddp_multi_host_command() {
        let mut env = two_hosts(8);
        env.instance_type = Some("ml.p4d.24xlarge".to_string());
        let opts = SmdataparallelOptions {
            efa: EfaOptions {
                enable_efa: true,
                enable_rdma: true,
            },
            ..Default::default()
        };
        let launcher = MpiLauncher::smdataparallel(&opts, 8);
        let cmd = launcher.orchestrator_command(&env, &MpiConfig::default(), &BTreeMap::new());
        let joined = cmd.join(" ");

        assert_eq!(cmd[2], "algo-1:8,algo-2:8");
        assert_eq!(cmd[4], "16");
        assert!(joined.contains("--oversubscribe"));
        assert!(joined.contains("-mca plm_rsh_num_concurrent 2"));
        assert!(joined.contains("-x SMDATAPARALLEL_USE_HOMOGENEOUS=1"));
        assert!(joined.contains("-x FI_PROVIDER=efa -x RDMAV_FORK_SAFE=1"));
        assert!(joined.contains("-x NCCL_PROTO=simple -x FI_EFA_USE_DEVICE_RDMA=1"));
        assert!(joined.contains("-x SMDATAPARALLEL_SERVER_ADDR=algo-1 -x SMDATAPARALLEL_SERVER_PORT=7592"));
        assert!(joined.contains("-x SAGEMAKER_INSTANCE_TYPE=ml.p4d.24xlarge"));
        assert_eq!(cmd.last().map(String::as_str), Some("smddprun"));
    }

    #[test]
    fn test_smddp_single_host_command() {
        let env = ExecutionEnvironment::single_host("algo-1", "train.py", "/opt/ml/code");
        let launcher = MpiLauncher::smdataparallel(&SmdataparallelOptions::default(), 8);
        let cmd = launcher.orchestrator_command(&env, &MpiConfig::default(), &BTreeMap::new());
        let joined = cmd.join(" ");

        assert_eq!(cmd[2], "algo-1");
        assert!(joined.contains("-x SMDATAPARALLEL_USE_SINGLENODE=1"));
        assert!(!joined.contains("SMDATAPARALLEL_SERVER_ADDR"));
    }

    #[test]
    fn test_payload_wraps_interpreter() {
        let launcher = MpiLauncher::mpi(&MpiOptions::default(), 1);
        let entry = EntryCommand {
            kind: process::EntryPointKind::PythonProgram,
            entry_point: "train.py".to_string(),
            args: vec!["--epochs".to_string(), "2".to_string()],
            interpreter: vec!["python".to_string()],
            shell: "/bin/sh".to_string(),
        };
        assert_eq!(
            launcher.payload(entry),
            vec!["python", "-m", "mpi4py", "train.py", "--epochs", "2"]
        );
    }

    #[tokio::test]
    async fn test_worker_without_daemon_is_configuration_error() {
        let mut config = RuntimeConfig::default();
        config.mpi.sshd = "/nonexistent/sshd".into();
        let ctx = context(config);

        let mut env = two_hosts(1);
        env.current_host = "algo-2".to_string();
        let result = MpiLauncher::mpi(&MpiOptions::default(), 1).launch(&ctx, &env).await;

        let failure = result.failure().unwrap();
        assert!(failure.message.contains("Daemon executable not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_job_sees_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = MpiConfig {
            status_file_prefix: dir.path().join("done").display().to_string(),
            orted_process_name: "no-such-daemon".to_string(),
            ..Default::default()
        };
        std::fs::write(dir.path().join("done.algo-1"), "").unwrap();

        assert_eq!(wait_for_job(&config, "algo-1").await, JobCompletion::StatusFile);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_job_gives_up_without_orted() {
        let dir = tempfile::tempdir().unwrap();
        let config = MpiConfig {
            status_file_prefix: dir.path().join("done").display().to_string(),
            orted_process_name: "no-such-daemon".to_string(),
            orted_start_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        assert_eq!(
            wait_for_job(&config, "algo-1").await,
            JobCompletion::OrtedNeverStarted
        );
    }

    #[tokio::test]
    async fn test_notify_workers_retries_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.mpi.ssh = fake_ssh(dir.path(), "algo-2", 2).display().to_string();
        config.mpi.status_file_prefix = "/tmp/launcher-done".to_string();
        config.mpi.status_file_retry_interval = Duration::from_millis(10);
        let ctx = context(config);

        let launcher = MpiLauncher::smdataparallel(&SmdataparallelOptions::default(), 1);
        let notified = launcher.notify_workers(&ctx, &three_hosts()).await;

        assert_eq!(notified, vec!["algo-2", "algo-3"]);
        let touch_2 = "algo-2 touch /tmp/launcher-done.algo-1";
        let touch_3 = "algo-3 touch /tmp/launcher-done.algo-1";
        assert_eq!(calls(dir.path()), vec![touch_2, touch_2, touch_2, touch_3]);
    }

    #[tokio::test]
    async fn test_notify_workers_gives_up_after_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.mpi.ssh = fake_ssh(dir.path(), "algo-3", 100).display().to_string();
        config.mpi.status_file_attempts = 2;
        config.mpi.status_file_retry_interval = Duration::from_millis(10);
        let ctx = context(config);

        let launcher = MpiLauncher::smdataparallel(&SmdataparallelOptions::default(), 1);
        let notified = launcher.notify_workers(&ctx, &three_hosts()).await;

        // The leader never notifies itself
        assert_eq!(notified, vec!["algo-2"]);
        let calls = calls(dir.path());
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.iter().filter(|c| c.starts_with("algo-3 ")).count(), 2);
        assert!(calls.iter().all(|c| !c.starts_with("algo-1 ")));
    }

    #[tokio::test]
    async fn test_leader_shutdown_during_rendezvous() {
        let dir = tempfile::tempdir().unwrap();
        let sshd = dir.path().join("sshd");
        script(&sshd, "exec sleep 30");
        std::fs::write(dir.path().join("train.py"), "").unwrap();

        let mut config = RuntimeConfig::default();
        config.mpi.sshd = sshd;
        let ctx = context(config);
        ctx.shutdown.cancel();

        let mut env = three_hosts();
        env.code_dir = dir.path().to_path_buf();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            MpiLauncher::mpi(&MpiOptions::default(), 1).launch(&ctx, &env),
        )
        .await
        .unwrap();

        let failure = result.failure().unwrap();
        assert_eq!(failure.exit_code, SHUTDOWN_EXIT_CODE);
        assert!(failure.message.contains("SSH rendezvous"));
    }

    #[tokio::test]
    async fn test_clear_status_file_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = MpiConfig {
            status_file_prefix: dir.path().join("done").display().to_string(),
            ..Default::default()
        };
        let stale = dir.path().join("done.algo-1");
        std::fs::write(&stale, "").unwrap();

        clear_status_file(&config, "algo-1").await.unwrap();
        assert!(!stale.exists());

        // Nothing to remove is fine too
        clear_status_file(&config, "algo-1").await.unwrap();
    }
}
