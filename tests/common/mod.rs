#![allow(dead_code)]

use mcp_supervisor::config::Config;
use mcp_supervisor::server::HttpProbe;
use mcp_supervisor::{CleanupRegistry, DefinitionSource, McpSupervisor};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Writes a shell script into `dir` and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    path
}

/// A port nothing is listening on right now.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn answer(listener: TcpListener, status: u16) {
    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {} Test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

/// Answers every request with `status` and an empty body until aborted.
pub fn serve_http(listener: TcpListener, status: u16) -> JoinHandle<()> {
    tokio::spawn(answer(listener, status))
}

/// Starts answering with `200` on `port` after `delay`; aborting the handle
/// closes the port.
pub fn serve_http_after(port: u16, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        answer(listener, 200).await;
    })
}

/// Whether a process with `pid` exists (and is not a reaped zombie).
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
}

/// One tool server in a test configuration.
pub struct TestServer<'a> {
    pub name: &'a str,
    pub port: u16,
    pub script: Option<&'a str>,
}

/// Configuration running `sh` scripts from `root`, with short timings.
pub fn config_yaml(root: &Path, servers: &[TestServer<'_>]) -> String {
    let mut yaml = String::from("mcp_servers:\n");
    for server in servers {
        yaml.push_str(&format!(
            "  {}:\n    enabled: true\n    config:\n      url: \"http://127.0.0.1:{}/sse\"\n",
            server.name, server.port
        ));
    }

    yaml.push_str(&format!(
        "supervisor:\n  project_root: \"{}\"\n  interpreter: \"sh\"\n  stop_grace_ms: 500\n  scripts: {{",
        root.display()
    ));
    let scripts: Vec<String> = servers
        .iter()
        .filter_map(|s| s.script.map(|script| format!("{}: \"{}\"", s.name, script)))
        .collect();
    yaml.push_str(&scripts.join(", "));
    yaml.push_str("}\n");
    yaml.push_str(
        "  startup:\n    timeout_ms: 2000\n    poll_interval_ms: 100\n  health:\n    timeout_ms: 500\n  monitor:\n    interval_secs: 1\n    shutdown_grace_ms: 500\n",
    );
    yaml
}

/// A supervisor with its own cleanup registry.
pub fn supervisor(yaml: &str) -> McpSupervisor {
    supervisor_with_registry(yaml, Arc::new(CleanupRegistry::new()))
}

/// A supervisor tracking its processes in `registry`.
pub fn supervisor_with_registry(yaml: &str, registry: Arc<CleanupRegistry>) -> McpSupervisor {
    let config = Config::parse_from_str(yaml).unwrap();
    let probe = Arc::new(HttpProbe::new(&config.supervisor.health));
    McpSupervisor::with_components(DefinitionSource::Inline(Box::new(config)), registry, probe)
        .unwrap()
}
