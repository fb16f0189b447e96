#![cfg(unix)]

mod common;

use common::{TestServer, config_yaml, free_port, pid_alive, serve_http, serve_http_after, supervisor, write_script};
use mcp_supervisor::server::{HttpProbe, ServerLifecycleEvent};
use mcp_supervisor::{CleanupRegistry, Config, DefinitionSource, Error, McpSupervisor, ServerStatus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const LONG_RUNNING: &str = "sleep 30";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_all_enabled_reports_running_server() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", LONG_RUNNING);
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
    ));

    let _server = serve_http_after(port, Duration::from_millis(150));
    let results = supervisor.start_all_enabled().await.unwrap();
    assert_eq!(results, HashMap::from([("toolA".to_string(), true)]));

    let report = serde_json::to_value(&supervisor.status()["toolA"]).unwrap();
    assert_eq!(report["enabled"], json!(true));
    assert_eq!(report["status"], json!("running"));
    assert_eq!(report["port"], json!(port));
    assert_eq!(report["error"], json!(null));
    assert_eq!(report["has_script"], json!(true));

    let pid = supervisor.server_pid("toolA").unwrap();
    assert!(pid_alive(pid));
    assert_eq!(
        supervisor.events("toolA", Some(1))[0].event,
        ServerLifecycleEvent::Started
    );

    supervisor.shutdown().await.unwrap();
    assert!(!pid_alive(pid));
    assert!(supervisor.registry().is_empty());
}

#[tokio::test]
async fn test_missing_script_marks_server_failed() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("not_there.sh") }],
    ));

    let results = supervisor.start_all_enabled().await.unwrap();
    assert_eq!(results, HashMap::from([("toolA".to_string(), false)]));

    let report = &supervisor.status()["toolA"];
    assert_eq!(report.status, ServerStatus::Failed);
    assert!(!report.has_script);
    assert!(report.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(supervisor.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_early_exit_captures_output() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "crash.sh",
        "echo \"fatal: cannot import bridge\" >&2\nexit 3",
    );
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("crash.sh") }],
    ));

    let err = supervisor.start("toolA").await.unwrap_err();
    assert!(matches!(err, Error::Process(_)));

    let report = &supervisor.status()["toolA"];
    assert_eq!(report.status, ServerStatus::Failed);
    assert!(
        report
            .error
            .as_deref()
            .is_some_and(|e| e.contains("fatal: cannot import bridge"))
    );
    assert_eq!(supervisor.server_pid("toolA"), None);
    assert!(supervisor.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_exit_reports_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "quiet.sh", "exit 7");
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("quiet.sh") }],
    ));

    assert!(supervisor.start("toolA").await.is_err());

    let error = supervisor.status()["toolA"].error.clone().unwrap();
    assert!(error.contains('7'), "unexpected error: {}", error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_occupied_port_is_adopted_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", "touch spawned\nsleep 30");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _server = serve_http(listener, 200);

    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
    ));

    supervisor.start("toolA").await.unwrap();

    assert_eq!(supervisor.server_status("toolA").unwrap(), ServerStatus::Running);
    assert_eq!(supervisor.server_pid("toolA"), None);
    assert!(supervisor.registry().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!dir.path().join("spawned").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", LONG_RUNNING);
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
    ));

    let _server = serve_http_after(port, Duration::from_millis(150));
    supervisor.start("toolA").await.unwrap();
    let pid = supervisor.server_pid("toolA").unwrap();
    let events = supervisor.events("toolA", None).len();

    supervisor.start("toolA").await.unwrap();

    assert_eq!(supervisor.server_pid("toolA"), Some(pid));
    assert_eq!(supervisor.registry().len(), 1);
    assert_eq!(supervisor.events("toolA", None).len(), events);
    assert_eq!(supervisor.server_status("toolA").unwrap(), ServerStatus::Running);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_rechecks_running_server_that_stopped_answering() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", LONG_RUNNING);
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
    ));

    let server = serve_http_after(port, Duration::from_millis(150));
    supervisor.start("toolA").await.unwrap();
    let pid = supervisor.server_pid("toolA").unwrap();

    server.abort();
    let _ = server.await;
    supervisor.start("toolA").await.unwrap();

    let recent: Vec<ServerLifecycleEvent> = supervisor
        .events("toolA", Some(3))
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(
        recent,
        vec![
            ServerLifecycleEvent::AssumedRunning,
            ServerLifecycleEvent::Starting,
            ServerLifecycleEvent::Failed,
        ]
    );
    assert_eq!(supervisor.server_pid("toolA"), Some(pid));
    assert_eq!(supervisor.registry().len(), 1);

    supervisor.shutdown().await.unwrap();
    assert!(!pid_alive(pid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", LONG_RUNNING);
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
    ));

    // nothing answers, so the first start runs until the startup bound
    let first = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.start("toolA").await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = supervisor.start("toolA").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyStarting(_)));

    first.await.unwrap().unwrap();
    assert_eq!(supervisor.server_status("toolA").unwrap(), ServerStatus::Running);
    assert_eq!(
        supervisor.events("toolA", Some(1))[0].event,
        ServerLifecycleEvent::AssumedRunning
    );

    supervisor.stop_all().await.unwrap();
    assert!(supervisor.registry().live_pids().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupted_start_is_resumed() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", LONG_RUNNING);
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
    ));

    let interrupted =
        tokio::time::timeout(Duration::from_millis(300), supervisor.start("toolA")).await;
    assert!(interrupted.is_err());

    let report = &supervisor.status()["toolA"];
    assert_eq!(report.status, ServerStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("start interrupted"));
    let pid = supervisor.server_pid("toolA").unwrap();
    assert!(pid_alive(pid));

    let _server = serve_http_after(port, Duration::ZERO);
    supervisor.start("toolA").await.unwrap();

    assert_eq!(supervisor.server_pid("toolA"), Some(pid));
    assert_eq!(supervisor.registry().len(), 1);
    assert!(supervisor.status()["toolA"].error.is_none());

    supervisor.shutdown().await.unwrap();
    assert!(!pid_alive(pid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\nwhile true; do sleep 1; done",
    );
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("stubborn.sh") }],
    ));

    let _server = serve_http_after(port, Duration::from_millis(150));
    supervisor.start("toolA").await.unwrap();
    let pid = supervisor.server_pid("toolA").unwrap();

    let started = Instant::now();
    supervisor.stop("toolA").await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(!pid_alive(pid));
    assert_eq!(supervisor.server_status("toolA").unwrap(), ServerStatus::Stopped);
    assert!(supervisor.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_all_leaves_no_live_processes() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool.sh", LONG_RUNNING);
    let port_a = free_port().await;
    let port_b = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[
            TestServer { name: "toolA", port: port_a, script: Some("tool.sh") },
            TestServer { name: "toolB", port: port_b, script: Some("tool.sh") },
        ],
    ));

    let _a = serve_http_after(port_a, Duration::from_millis(150));
    let _b = serve_http_after(port_b, Duration::from_millis(150));
    let results = supervisor.start_all_enabled().await.unwrap();
    assert!(results.values().all(|started| *started));

    let pids: Vec<u32> = ["toolA", "toolB"]
        .iter()
        .filter_map(|name| supervisor.server_pid(name))
        .collect();
    assert_eq!(pids.len(), 2);

    supervisor.stop_all().await.unwrap();

    assert!(supervisor.registry().live_pids().is_empty());
    assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    for report in supervisor.status().values() {
        assert_eq!(report.status, ServerStatus::Stopped);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_restarts_unhealthy_server_once() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "tool_a.sh", LONG_RUNNING);
    let port = free_port().await;
    let supervisor = supervisor(&config_yaml(
        dir.path(),
        &[TestServer { name: "toolA", port, script: Some("tool_a.sh") }],
    ));

    let server = serve_http_after(port, Duration::from_millis(150));
    supervisor.start("toolA").await.unwrap();
    let first_pid = supervisor.server_pid("toolA").unwrap();

    assert!(supervisor.start_health_monitor().await);
    assert!(supervisor.start_health_monitor().await);

    // the server stops answering while its process stays alive
    server.abort();

    let deadline = Instant::now() + Duration::from_secs(10);
    let second_pid = loop {
        if let Some(pid) = supervisor.server_pid("toolA") {
            if pid != first_pid
                && supervisor.server_status("toolA").unwrap() == ServerStatus::Running
            {
                break pid;
            }
        }
        assert!(Instant::now() < deadline, "server was not restarted");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    supervisor.stop_health_monitor().await;

    let failures = supervisor
        .events("toolA", None)
        .into_iter()
        .filter(|e| {
            e.event == ServerLifecycleEvent::Failed
                && e.details.as_deref() == Some("health check failed")
        })
        .count();
    assert_eq!(failures, 1);
    assert!(!pid_alive(first_pid));
    assert!(pid_alive(second_pid));

    supervisor.shutdown().await.unwrap();
    assert!(!pid_alive(second_pid));
}

#[tokio::test]
async fn test_reload_keeps_removed_servers_reportable() {
    let dir = assert_fs::TempDir::new().unwrap();
    let config_path = dir.path().join("mcp_servers.yaml");
    let (port_a, port_b) = (free_port().await, free_port().await);
    std::fs::write(
        &config_path,
        config_yaml(dir.path(), &[TestServer { name: "toolA", port: port_a, script: None }]),
    )
    .unwrap();

    let config = Config::from_file(&config_path).unwrap();
    let supervisor = McpSupervisor::with_components(
        DefinitionSource::File(config_path.clone()),
        Arc::new(CleanupRegistry::new()),
        Arc::new(HttpProbe::new(&config.supervisor.health)),
    )
    .unwrap();

    let results = supervisor.start_all_enabled().await.unwrap();
    assert_eq!(results, HashMap::from([("toolA".to_string(), false)]));

    std::fs::write(
        &config_path,
        config_yaml(dir.path(), &[TestServer { name: "toolB", port: port_b, script: None }]),
    )
    .unwrap();
    let results = supervisor.start_all_enabled().await.unwrap();
    assert_eq!(results, HashMap::from([("toolB".to_string(), false)]));

    let status = supervisor.status();
    assert_eq!(status.len(), 2);
    assert!(!status["toolA"].enabled);
    assert_eq!(status["toolA"].status, ServerStatus::Failed);
    assert!(status["toolB"].enabled);
}

#[tokio::test]
async fn test_missing_config_file_yields_no_servers() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = McpSupervisor::with_components(
        DefinitionSource::File(dir.path().join("absent.yaml")),
        Arc::new(CleanupRegistry::new()),
        Arc::new(HttpProbe::default()),
    )
    .unwrap();

    assert!(supervisor.start_all_enabled().await.unwrap().is_empty());
    assert!(supervisor.status().is_empty());
    assert!(matches!(
        supervisor.start("toolA").await,
        Err(Error::ServerNotFound(_))
    ));
}
