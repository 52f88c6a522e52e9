//! Tunnel manager against a scripted stand-in for the frp client.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use homestead_core::tunnel::{
    RestartPolicy, ServerIdentity, TunnelError, TunnelEvent, TunnelLaunch, TunnelManager,
    TunnelOutcome, TunnelStatus,
};
use homestead_test_utils::config::TEST_OWNER;
use homestead_test_utils::frpc::{self, AUTH_REJECTED, CRASHES, IGNORES_TERM, REGISTERS};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn launch(binary: std::path::PathBuf) -> TunnelLaunch {
    TunnelLaunch {
        identity: Arc::new(ServerIdentity::generate()),
        owner: TEST_OWNER.to_string(),
        server_addr: "127.0.0.1".into(),
        server_port: 7000,
        public_domain: "server.example.org".into(),
        local_port: 8080,
        binary: Some(binary),
        grace_period: Duration::from_millis(300),
        verify: None,
    }
}

fn fast_policy(max_retries: u32) -> RestartPolicy {
    RestartPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_jitter: Duration::ZERO,
        max_retries,
        reset_after: Duration::from_secs(60),
    }
}

/// Feed events back into the manager until `done` holds.
async fn pump_until(
    manager: &mut TunnelManager,
    events: &mut UnboundedReceiver<TunnelEvent>,
    mut done: impl FnMut(&TunnelManager, TunnelOutcome) -> bool,
) {
    let pump = async {
        while let Some(event) = events.recv().await {
            let outcome = manager.handle_event(event).await;
            if done(&*manager, outcome) {
                return;
            }
        }
        panic!("event channel closed");
    };
    tokio::time::timeout(Duration::from_secs(10), pump)
        .await
        .expect("timed out pumping tunnel events");
}

#[test_log::test(tokio::test)]
async fn registers_then_stops_cleanly() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let path = frpc::write_fake_frpc(bin.path(), REGISTERS);
    let (mut manager, mut events) = TunnelManager::new(root.path(), fast_policy(3));

    let url = manager.start(launch(path.clone())).await.unwrap();
    assert_eq!(manager.status().status, TunnelStatus::Connecting);
    assert_eq!(manager.public_url(), Some(url.as_str()));

    pump_until(&mut manager, &mut events, |m, _| {
        m.status().status == TunnelStatus::Connected
    })
    .await;
    assert!(manager.is_running());

    let err = manager.start(launch(path)).await.unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyRunning));

    let rendered = std::fs::read_to_string(root.path().join("tunnel").join("frpc.toml")).unwrap();
    let table: toml::Table = rendered.parse().unwrap();
    assert_eq!(table["serverPort"].as_integer(), Some(7000));

    manager.stop().await;
    let status = manager.status();
    assert_eq!(status.status, TunnelStatus::Stopped);
    assert_eq!(status.public_url, None);
    assert_eq!(status.connected_since, None);
    assert!(!manager.is_running());
    assert_eq!(frpc::invocations(bin.path()), 1);
}

#[test_log::test(tokio::test)]
async fn auth_rejection_is_an_error_without_restart() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let path = frpc::write_fake_frpc(bin.path(), AUTH_REJECTED);
    let (mut manager, mut events) = TunnelManager::new(root.path(), fast_policy(3));

    manager.start(launch(path)).await.unwrap();
    pump_until(&mut manager, &mut events, |m, _| {
        m.status().status == TunnelStatus::Error
    })
    .await;

    let status = manager.status();
    assert!(status.last_error.unwrap().contains("authorization failed"));
    assert_eq!(frpc::invocations(bin.path()), 1);
    manager.stop().await;
}

#[test_log::test(tokio::test)]
async fn crashing_client_is_restarted_until_exhausted() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let path = frpc::write_fake_frpc(bin.path(), CRASHES);
    let (mut manager, mut events) = TunnelManager::new(root.path(), fast_policy(2));

    manager.start(launch(path)).await.unwrap();
    let mut final_outcome = TunnelOutcome::Continue;
    pump_until(&mut manager, &mut events, |_, outcome| {
        final_outcome = outcome;
        matches!(outcome, TunnelOutcome::Exhausted { .. })
    })
    .await;

    assert_eq!(final_outcome, TunnelOutcome::Exhausted { attempts: 2 });
    assert_eq!(frpc::invocations(bin.path()), 3);
    let status = manager.status();
    assert_eq!(status.status, TunnelStatus::Stopped);
    assert_eq!(status.public_url, None);
    assert!(status.last_error.unwrap().contains("exhausted"));
    assert!(manager.is_idle());

    manager.stop().await;
    assert_eq!(manager.status().status, TunnelStatus::Stopped);
}

#[test_log::test(tokio::test)]
async fn stubborn_client_is_killed_after_grace_period() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let path = frpc::write_fake_frpc(bin.path(), IGNORES_TERM);
    let (mut manager, mut events) = TunnelManager::new(root.path(), fast_policy(3));

    manager.start(launch(path)).await.unwrap();
    pump_until(&mut manager, &mut events, |m, _| m.is_running()).await;

    let started = std::time::Instant::now();
    manager.stop().await;
    let took = started.elapsed();
    assert!(took >= Duration::from_millis(300), "stopped after {took:?}");
    assert!(took < Duration::from_secs(5), "stopped after {took:?}");
    assert_eq!(manager.status().status, TunnelStatus::Stopped);

    // Nothing from the killed process is reported afterwards.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        assert_eq!(manager.handle_event(event).await, TunnelOutcome::Continue);
    }
    assert_eq!(manager.status().status, TunnelStatus::Stopped);
}

#[test_log::test(tokio::test)]
async fn claim_refresh_relaunches_without_dropping_connection() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let path = frpc::write_fake_frpc(bin.path(), REGISTERS);
    let (manager, mut events) = TunnelManager::new(root.path(), fast_policy(3));
    let mut manager = manager.with_refresh_interval(Duration::from_millis(200));

    manager.start(launch(path)).await.unwrap();
    pump_until(&mut manager, &mut events, |m, _| m.is_running()).await;
    let first_claim = std::fs::read_to_string(root.path().join("tunnel").join("frpc.toml")).unwrap();

    pump_until(&mut manager, &mut events, |_, _| {
        frpc::invocations(bin.path()) >= 2
    })
    .await;
    assert_eq!(manager.status().status, TunnelStatus::Connected);

    let second_claim = std::fs::read_to_string(root.path().join("tunnel").join("frpc.toml")).unwrap();
    assert_ne!(first_claim, second_claim);
    manager.stop().await;
}
