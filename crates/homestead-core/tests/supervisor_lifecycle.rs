//! End-to-end daemon lifecycle through the public control channel.

use std::time::Duration;

use homestead_core::ipc::{ControlClientError, ControlRequest, ErrorCode};
use homestead_core::pid::PID_FILENAME;
use homestead_core::{
    PidRegistry, RuntimeState, Supervisor, SupervisorError, TunnelStatus, resolve_socket_path,
};
use homestead_test_utils::{TestConfigBuilder, TestRoot, capture_logs};
use pretty_assertions::assert_eq;

async fn wait_for_state(root: &TestRoot, want: RuntimeState) {
    let client = root.client();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = client.status().await.unwrap();
        if status.runtime_state == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "still {} (tunnel {:?}) waiting for {want}",
            status.runtime_state,
            status.tunnel
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_log::test(tokio::test)]
async fn local_only_lifecycle() {
    let root = TestRoot::new(TestConfigBuilder::new().build()).await;
    let supervisor = Supervisor::start(root.options()).await.unwrap();
    let port = supervisor.http_addr().port();
    let run = tokio::spawn(supervisor.run());

    let client = root.client();
    let status = client.status().await.unwrap();
    assert_eq!(status.runtime_state, RuntimeState::LocalOnly);
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.port, port);
    assert_eq!(status.tunnel.status, TunnelStatus::Stopped);
    assert!(!status.tunnel.enabled);

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.pid, std::process::id());

    let http: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(http["status"], "healthy");
    assert_eq!(http["runtimeState"], "local_only");

    let response = client
        .request(&ControlRequest::new("restart"))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, ErrorCode::UnknownCommand);

    let stop = client.stop().await.unwrap();
    assert!(stop.acknowledged);
    assert!(!stop.already_stopping);
    assert_eq!(stop.runtime_state, RuntimeState::Stopping);

    assert_eq!(run.await.unwrap().unwrap(), RuntimeState::Stopped);
    assert_eq!(PidRegistry::new(root.path()).read().await.unwrap(), None);
    assert!(matches!(
        client.status().await.unwrap_err(),
        ControlClientError::ConnectionRefused { .. }
    ));
}

#[test_log::test(tokio::test)]
async fn second_instance_is_refused() {
    let root = TestRoot::new(TestConfigBuilder::new().build()).await;
    let supervisor = Supervisor::start(root.options()).await.unwrap();

    // Same process, so the PID check passes; the control bind does not.
    let err = Supervisor::start(root.options()).await.err().unwrap();
    match err {
        SupervisorError::ControlBind { source, .. } => {
            assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(PidRegistry::new(root.path()).read().await.unwrap().is_some());

    let run = tokio::spawn(supervisor.run());
    root.client().stop().await.unwrap();
    run.await.unwrap().unwrap();
}

#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn live_pid_file_from_another_process_is_refused() {
    let root = TestRoot::new(TestConfigBuilder::new().build()).await;
    let mut other = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let other_pid = other.id().unwrap();

    let registry = PidRegistry::new(root.path());
    registry
        .write(&homestead_core::ServerMetadata {
            process_id: other_pid,
            control_address: "elsewhere".into(),
            root_path: root.path().display().to_string(),
            started_at: chrono::Utc::now(),
            port: 1,
            version: "0.0.0".into(),
        })
        .await
        .unwrap();

    let result = Supervisor::start(root.options()).await;
    other.kill().await.ok();
    match result {
        Err(SupervisorError::AlreadyRunning { pid, .. }) => assert_eq!(pid, other_pid),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("started despite a live PID file"),
    }
}

#[test_log::test(tokio::test)]
async fn reload_toggles_tunnel_enablement() {
    let root = TestRoot::new(TestConfigBuilder::new().build()).await;
    let supervisor = Supervisor::start(root.options()).await.unwrap();
    let run = tokio::spawn(supervisor.run());
    let client = root.client();

    // Enabled without an owner: accepted, but the tunnel stays down.
    root.write_config(&TestConfigBuilder::new().tunnel_enabled(true).build())
        .await;
    let reloaded = client.reload().await.unwrap();
    assert!(reloaded.tunnel_enabled);
    assert_eq!(reloaded.tunnel_status.status, TunnelStatus::Stopped);
    assert!(reloaded.restart_required.is_empty());

    let status = client.status().await.unwrap();
    assert!(status.tunnel.enabled);
    assert_eq!(status.runtime_state, RuntimeState::LocalOnly);

    client.stop().await.unwrap();
    run.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn concurrent_stops_have_one_winner() {
    let root = TestRoot::new(TestConfigBuilder::new().build()).await;
    let supervisor = Supervisor::start(root.options()).await.unwrap();
    let run = tokio::spawn(supervisor.run());

    let (first, second) = (root.client(), root.client());
    let (a, b) = tokio::join!(first.stop(), second.stop());
    let results: Vec<_> = [a, b].into_iter().filter_map(Result::ok).collect();
    assert_eq!(
        results.iter().filter(|r| !r.already_stopping).count(),
        1,
        "{results:?}"
    );

    assert_eq!(run.await.unwrap().unwrap(), RuntimeState::Stopped);
}

#[tokio::test]
async fn logs_command_serves_captured_entries() {
    let (logs, _guard) = capture_logs();
    let root = TestRoot::new(TestConfigBuilder::new().build()).await;
    let supervisor = Supervisor::start(root.options().with_logs(logs))
        .await
        .unwrap();
    let run = tokio::spawn(supervisor.run());

    let client = root.client();
    let all = client.logs(None).await.unwrap();
    let bound = all.entries.iter().any(|e| {
        e.message.starts_with("Runtime state transition") && e.message.contains("to=local_only")
    });
    assert!(bound, "{:?}", all.entries);

    let last = client.logs(Some(1)).await.unwrap();
    assert_eq!(last.entries.len(), 1);
    assert!(last.total >= all.entries.len());

    client.stop().await.unwrap();
    assert_eq!(run.await.unwrap().unwrap(), RuntimeState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn pid_write_failure_faults_and_releases_the_control_socket() {
    let (logs, _guard) = capture_logs();
    let root = TestRoot::new(TestConfigBuilder::new().build()).await;
    // A directory where the temp file would go makes the write fail.
    let blocker = root
        .path()
        .join(format!("{PID_FILENAME}.{}.tmp", std::process::id()));
    std::fs::create_dir_all(blocker.join("occupied")).unwrap();

    let err = Supervisor::start(root.options()).await.err().unwrap();
    assert!(matches!(err, SupervisorError::Pid(_)), "{err}");
    assert!(!resolve_socket_path(root.path()).exists());
    assert_eq!(PidRegistry::new(root.path()).read().await.unwrap(), None);

    let faulted = logs
        .entries(None)
        .iter()
        .any(|e| e.message.contains("to=faulted") && e.message.contains("PID file"));
    assert!(faulted, "{:?}", logs.entries(None));
}

#[cfg(unix)]
mod tunneled {
    use super::{TestConfigBuilder, TestRoot, wait_for_state};
    use homestead_core::{RuntimeState, Supervisor, TunnelStatus};
    use homestead_test_utils::config::TEST_OWNER;
    use homestead_test_utils::frpc::{self, CRASHES, DROPS_ONCE, REGISTERS};
    use pretty_assertions::assert_eq;

    #[test_log::test(tokio::test)]
    async fn tunnel_registration_moves_daemon_to_tunneled() {
        let bin = tempfile::TempDir::new().unwrap();
        let frpc_path = frpc::write_fake_frpc(bin.path(), REGISTERS);
        let config = TestConfigBuilder::new()
            .tunnel_enabled(true)
            .owner(TEST_OWNER)
            .tunnel_binary(&frpc_path)
            .grace_period_ms(500)
            .build();
        let root = TestRoot::new(config).await;

        let supervisor = Supervisor::start(root.options()).await.unwrap();
        let run = tokio::spawn(supervisor.run());
        wait_for_state(&root, RuntimeState::Tunneled).await;

        let status = root.client().status().await.unwrap();
        assert_eq!(status.tunnel.status, TunnelStatus::Connected);
        assert!(status.tunnel.connected_since.is_some());
        let url = status.tunnel.public_url.unwrap();
        assert!(url.starts_with("https://0x"), "{url}");
        assert!(url.ends_with(".server.vana.org"), "{url}");

        assert!(root.path().join("keys").join("server.key").exists());
        assert!(root.path().join("tunnel").join("frpc.toml").exists());
        assert_eq!(frpc::invocations(bin.path()), 1);

        // Disabling the tunnel on reload drops back to local-only.
        root.write_config(&TestConfigBuilder::new().owner(TEST_OWNER).build())
            .await;
        let reloaded = root.client().reload().await.unwrap();
        assert!(!reloaded.tunnel_enabled);
        assert_eq!(reloaded.tunnel_status.status, TunnelStatus::Stopped);
        assert_eq!(
            root.client().status().await.unwrap().runtime_state,
            RuntimeState::LocalOnly
        );

        root.client().stop().await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), RuntimeState::Stopped);
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_restarts_fault_the_daemon() {
        let bin = tempfile::TempDir::new().unwrap();
        let frpc_path = frpc::write_fake_frpc(bin.path(), CRASHES);
        let config = TestConfigBuilder::new()
            .tunnel_enabled(true)
            .owner(TEST_OWNER)
            .tunnel_binary(&frpc_path)
            .fast_restarts(2)
            .build();
        let root = TestRoot::new(config).await;

        let supervisor = Supervisor::start(root.options()).await.unwrap();
        let run = tokio::spawn(supervisor.run());
        wait_for_state(&root, RuntimeState::Faulted).await;

        let status = root.client().status().await.unwrap();
        assert_eq!(status.tunnel.status, TunnelStatus::Stopped);
        assert_eq!(status.tunnel.public_url, None);
        assert_eq!(status.tunnel.connected_since, None);
        assert!(
            status
                .tunnel
                .last_error
                .unwrap()
                .contains("restart attempts exhausted")
        );
        assert_eq!(frpc::invocations(bin.path()), 3);

        // Faulted needs an explicit stop, which goes straight to Stopped.
        let stop = root.client().stop().await.unwrap();
        assert_eq!(stop.runtime_state, RuntimeState::Stopped);
        assert_eq!(run.await.unwrap().unwrap(), RuntimeState::Stopped);
    }

    #[test_log::test(tokio::test)]
    async fn dropped_tunnel_falls_back_then_recovers_after_restart() {
        let bin = tempfile::TempDir::new().unwrap();
        let frpc_path = frpc::write_fake_frpc(bin.path(), DROPS_ONCE);
        let config = TestConfigBuilder::new()
            .tunnel_enabled(true)
            .owner(TEST_OWNER)
            .tunnel_binary(&frpc_path)
            .fast_restarts(3)
            .build();
        let root = TestRoot::new(config).await;

        let supervisor = Supervisor::start(root.options()).await.unwrap();
        let run = tokio::spawn(supervisor.run());

        wait_for_state(&root, RuntimeState::Tunneled).await;
        wait_for_state(&root, RuntimeState::LocalOnly).await;
        let status = root.client().status().await.unwrap();
        assert_ne!(status.tunnel.status, TunnelStatus::Connected);
        assert!(status.tunnel.public_url.is_some());

        wait_for_state(&root, RuntimeState::Tunneled).await;
        let status = root.client().status().await.unwrap();
        assert_eq!(status.tunnel.status, TunnelStatus::Connected);
        assert_eq!(status.tunnel.last_error, None);
        assert_eq!(frpc::invocations(bin.path()), 2);

        root.client().stop().await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), RuntimeState::Stopped);
    }

    #[test_log::test(tokio::test)]
    async fn reload_relaunches_a_tunnel_that_failed_to_start() {
        let bin = tempfile::TempDir::new().unwrap();
        let frpc_path = bin.path().join("frpc");
        let config = TestConfigBuilder::new()
            .tunnel_enabled(true)
            .owner(TEST_OWNER)
            .tunnel_binary(&frpc_path)
            .build();
        let root = TestRoot::new(config).await;

        let supervisor = Supervisor::start(root.options()).await.unwrap();
        let run = tokio::spawn(supervisor.run());
        let status = root.client().status().await.unwrap();
        assert_eq!(status.tunnel.status, TunnelStatus::Error);
        assert!(status.tunnel.last_error.unwrap().contains("not found"));

        // Same config; only the binary appeared.
        frpc::write_fake_frpc(bin.path(), REGISTERS);
        let reloaded = root.client().reload().await.unwrap();
        assert_eq!(reloaded.tunnel_status.status, TunnelStatus::Connecting);
        wait_for_state(&root, RuntimeState::Tunneled).await;
        assert_eq!(frpc::invocations(bin.path()), 1);

        root.client().stop().await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), RuntimeState::Stopped);
    }
}
