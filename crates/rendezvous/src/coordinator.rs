//! Rendezvous coordinator

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use runtime_core::config::RendezvousConfig;
use runtime_core::{elect_leader, Error, HostId, HostRole, Result};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::poll::TimedPoll;
use crate::probe::{probe_for_mode, HostProbe};

/// Lifecycle of one rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousPhase {
    /// Some hosts have not answered yet
    Waiting,

    /// Every host answered
    Ready,

    /// The deadline passed first
    TimedOut,
}

/// Progress of one rendezvous
#[derive(Debug, Clone)]
pub struct RendezvousState {
    /// Hosts expected to take part
    pub expected: Vec<HostId>,

    /// Hosts that answered a probe
    pub confirmed: BTreeSet<HostId>,

    /// Point in time after which no round starts
    pub deadline: Instant,

    /// Role of the current host
    pub role: HostRole,

    /// Current phase
    pub phase: RendezvousPhase,
}

impl RendezvousState {
    fn new(hosts: &[HostId], current_host: &str, deadline: Instant) -> Self {
        let mut expected = hosts.to_vec();
        expected.sort();
        expected.dedup();
        Self {
            role: HostRole::for_host(current_host, &expected),
            expected,
            confirmed: BTreeSet::new(),
            deadline,
            phase: RendezvousPhase::Waiting,
        }
    }

    /// Hosts still waited on, in sorted order
    pub fn pending(&self) -> Vec<HostId> {
        self.expected
            .iter()
            .filter(|h| !self.confirmed.contains(*h))
            .cloned()
            .collect()
    }

    fn confirm(&mut self, host: HostId) {
        if self.confirmed.insert(host.clone()) {
            debug!(host = %host, "Host is reachable");
        }
    }
}

/// Result of a successful rendezvous
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousOutcome {
    /// All hosts, sorted
    pub hosts: Vec<HostId>,

    /// Elected leader
    pub leader: HostId,

    /// Role of the current host
    pub role: HostRole,

    /// Probe rounds it took
    pub rounds: u64,

    /// Time spent waiting
    pub elapsed: Duration,
}

/// Waits until every host of a run is reachable or the budget runs out
pub struct RendezvousCoordinator {
    timeout: Duration,
    poll_interval: Duration,
    probe: Arc<dyn HostProbe>,
}

impl RendezvousCoordinator {
    /// Create a coordinator using `probe`
    pub fn new(config: &RendezvousConfig, probe: Arc<dyn HostProbe>) -> Self {
        Self {
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            probe,
        }
    }

    /// Create a coordinator using the configured probe mode
    pub fn from_config(config: &RendezvousConfig) -> Self {
        Self::new(config, probe_for_mode(config))
    }

    /// Override the overall budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until every host in `hosts` answers a probe
    ///
    /// Each round probes the pending hosts concurrently. Hosts that
    /// answered are never probed again and nothing is probed after the
    /// last host answered. Fails with [`Error::Rendezvous`] naming the
    /// unreachable hosts once the budget is spent.
    pub async fn wait_for_hosts(
        &self,
        hosts: &[HostId],
        current_host: &str,
    ) -> Result<RendezvousOutcome> {
        let started = Instant::now();
        let mut poll = TimedPoll::new(self.poll_interval, self.timeout);
        let mut state = RendezvousState::new(hosts, current_host, poll.deadline());

        info!(
            hosts = ?state.expected,
            role = %state.role,
            timeout_ms = self.timeout.as_millis() as u64,
            "Waiting for hosts"
        );

        while !state.pending().is_empty() && poll.wait_next().await {
            self.probe_round(&mut state).await;
        }

        let pending = state.pending();
        if pending.is_empty() {
            state.phase = RendezvousPhase::Ready;
            let outcome = RendezvousOutcome {
                leader: elect_leader(&state.expected)
                    .unwrap_or(current_host)
                    .to_string(),
                hosts: state.expected,
                role: state.role,
                rounds: poll.rounds(),
                elapsed: started.elapsed(),
            };
            info!(
                leader = %outcome.leader,
                rounds = outcome.rounds,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "All hosts reachable"
            );
            return Ok(outcome);
        }

        state.phase = RendezvousPhase::TimedOut;
        warn!(unreachable = ?pending, "Rendezvous timed out");
        Err(Error::Rendezvous {
            unreachable: pending,
            timeout_ms: self.timeout.as_millis() as u64,
        })
    }

    async fn probe_round(&self, state: &mut RendezvousState) {
        let mut probes = JoinSet::new();
        for host in state.pending() {
            let probe = self.probe.clone();
            probes.spawn(async move {
                let reachable = probe.probe(&host).await;
                (host, reachable)
            });
        }

        // The round at the deadline still gets one interval to answer
        let round_deadline = state.deadline.max(Instant::now() + self.poll_interval);
        let collect = async {
            while let Some(joined) = probes.join_next().await {
                match joined {
                    Ok((host, true)) => state.confirm(host),
                    Ok((_, false)) => {}
                    Err(e) => warn!(error = %e, "Probe task failed"),
                }
            }
        };
        if tokio::time::timeout_at(round_deadline, collect).await.is_err() {
            debug!("Probe round cut short by the deadline");
        }
    }
}
