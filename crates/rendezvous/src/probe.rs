//! Host reachability probes

use async_trait::async_trait;
use runtime_core::config::{ProbeMode, RendezvousConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Decides whether one host is reachable right now
///
/// A probe answers once; retrying is the coordinator's job.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self, host: &str) -> bool;
}

/// Reachable when the name resolves to at least one address
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveProbe;

#[async_trait]
impl HostProbe for ResolveProbe {
    async fn probe(&self, host: &str) -> bool {
        match lookup_host((host, 0)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(host = %host, error = %e, "Host does not resolve yet");
                false
            }
        }
    }
}

/// Reachable when a TCP connection to `port` succeeds
#[derive(Debug, Clone, Copy)]
pub struct ConnectProbe {
    port: u16,
    connect_timeout: Duration,
}

impl ConnectProbe {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl HostProbe for ConnectProbe {
    async fn probe(&self, host: &str) -> bool {
        let addrs = match lookup_host((host, self.port)).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                debug!(host = %host, error = %e, "Host does not resolve yet");
                return false;
            }
        };

        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => debug!(host = %host, addr = %addr, error = %e, "Connect failed"),
                Err(_) => debug!(host = %host, addr = %addr, "Connect timed out"),
            }
        }
        false
    }
}

/// Probe selected by the rendezvous configuration
pub fn probe_for_mode(config: &RendezvousConfig) -> Arc<dyn HostProbe> {
    match config.probe {
        ProbeMode::Resolve => Arc::new(ResolveProbe),
        ProbeMode::Connect { port } => Arc::new(ConnectProbe::new(port, config.connect_timeout)),
    }
}
