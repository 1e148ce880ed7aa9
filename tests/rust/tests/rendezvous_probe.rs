//! Rendezvous against real sockets

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rendezvous::{ConnectProbe, HostProbe, RendezvousCoordinator};
use runtime_core::config::RendezvousConfig;
use runtime_core::{Error, HostRole};
use tokio::net::TcpListener;

fn config(timeout: Duration) -> RendezvousConfig {
    RendezvousConfig {
        timeout,
        poll_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_probe_sees_listener() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let probe = ConnectProbe::new(port, Duration::from_millis(200));

    assert!(probe.probe("127.0.0.1").await);

    drop(listener);
    assert!(!probe.probe("127.0.0.1").await);
    Ok(())
}

#[tokio::test]
async fn test_worker_waits_for_late_leader() -> Result<()> {
    let port = portpicker::pick_unused_port().expect("free port");
    let config = config(Duration::from_secs(10));
    let coordinator = RendezvousCoordinator::new(
        &config,
        Arc::new(ConnectProbe::new(port, config.connect_timeout)),
    );

    // The leader's daemon comes up a few rounds late
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(listener);
        Ok::<_, std::io::Error>(())
    });

    let hosts = vec!["127.0.0.1".to_string()];
    let outcome = coordinator.wait_for_hosts(&hosts, "worker").await?;

    assert_eq!(outcome.leader, "127.0.0.1");
    assert!(outcome.rounds > 1);
    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_unreachable_port_times_out() -> Result<()> {
    let port = portpicker::pick_unused_port().expect("free port");
    let config = config(Duration::from_millis(300));
    let coordinator = RendezvousCoordinator::new(
        &config,
        Arc::new(ConnectProbe::new(port, config.connect_timeout)),
    );

    let hosts = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    let err = coordinator
        .wait_for_hosts(&hosts, "127.0.0.1")
        .await
        .expect_err("nothing listens");

    match err {
        Error::Rendezvous {
            unreachable,
            timeout_ms,
        } => {
            assert_eq!(unreachable, vec!["127.0.0.1", "localhost"]);
            assert_eq!(timeout_ms, 300);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(HostRole::for_host("127.0.0.1", &hosts), HostRole::Leader);
    Ok(())
}
