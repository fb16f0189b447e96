#![cfg(unix)]

mod common;

use common::{TestServer, config_yaml, free_port, pid_alive, serve_http_after, supervisor_with_registry, write_script};
use mcp_supervisor::cleanup::termination_requested;
use mcp_supervisor::{CleanupRegistry, Error, install_cleanup_hooks};
use nix::sys::signal::{Signal, raise};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};

// Raising SIGTERM affects the whole test binary, so this file holds a single test.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_termination_signal_cleans_up_and_stops_supervision() {
    // keeps the default SIGTERM action from ending the test binary
    let _sigterm = signal(SignalKind::terminate()).unwrap();

    let registry = Arc::new(CleanupRegistry::new());
    let hooks = install_cleanup_hooks(Arc::clone(&registry)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", "sleep 30");
    let port = free_port().await;
    let supervisor = supervisor_with_registry(
        &config_yaml(
            dir.path(),
            &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
        ),
        Arc::clone(&registry),
    );

    let server = serve_http_after(port, Duration::from_millis(150));
    supervisor.start("toolA").await.unwrap();
    let pid = supervisor.server_pid("toolA").unwrap();
    assert!(supervisor.start_health_monitor().await);
    assert!(!termination_requested());

    raise(Signal::SIGTERM).unwrap();
    tokio::time::timeout(Duration::from_secs(10), hooks.shutdown_requested())
        .await
        .expect("cleanup pass did not finish");

    assert!(termination_requested());
    assert!(registry.is_empty());
    assert!(!pid_alive(pid));

    // the killed server no longer answers; two monitor intervals pass
    server.abort();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(!supervisor.is_monitoring().await);
    assert_eq!(supervisor.server_pid("toolA"), None);
    assert!(registry.is_empty());
    assert!(matches!(
        supervisor.start("toolA").await,
        Err(Error::ShuttingDown)
    ));
    assert!(registry.is_empty());

    drop(hooks);
}
