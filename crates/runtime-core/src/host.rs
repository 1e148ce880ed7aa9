//! Host roles and static leader election

use serde::{Deserialize, Serialize};

/// Role of a host in a distributed run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HostRole {
    /// Drives the distributed orchestrator
    Leader,

    /// Participates passively
    Worker,
}

impl HostRole {
    /// Role of `host` within `hosts`
    ///
    /// Every host receives the same host list, so every host computes the
    /// same answer without talking to anyone.
    pub fn for_host(host: &str, hosts: &[String]) -> Self {
        match elect_leader(hosts) {
            Some(leader) if leader == host => HostRole::Leader,
            Some(_) => HostRole::Worker,
            // A host list without entries only describes a local run
            None => HostRole::Leader,
        }
    }

    /// Returns true for the leader
    pub fn is_leader(&self) -> bool {
        matches!(self, HostRole::Leader)
    }
}

impl std::fmt::Display for HostRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostRole::Leader => write!(f, "leader"),
            HostRole::Worker => write!(f, "worker"),
        }
    }
}

/// Lexicographically smallest host identifier
pub fn elect_leader(hosts: &[String]) -> Option<&str> {
    hosts.iter().min().map(String::as_str)
}
