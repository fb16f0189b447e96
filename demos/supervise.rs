use anyhow::Context;
use mcp_supervisor::api::ApiServer;
use mcp_supervisor::cleanup::{CleanupRegistry, install_cleanup_hooks};
use mcp_supervisor::{Config, McpSupervisor};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    // `with_env_filter` reads the RUST_LOG environment variable to set the log level.
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/mcp_servers.yaml".to_string());
    tracing::info!(config_path = %config_path, "Starting supervise example");

    // Install before anything is spawned; dropping `hooks` at the end of
    // `main` runs the final cleanup pass.
    let hooks = install_cleanup_hooks(CleanupRegistry::global())
        .context("installing cleanup hooks")?;

    let supervisor = McpSupervisor::from_config_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;

    let results = supervisor.start_all_enabled().await?;
    for (name, started) in &results {
        println!("{}: {}", name, if *started { "started" } else { "failed" });
    }

    if supervisor.start_health_monitor().await {
        println!("Health monitor running");
    }

    let api = match Config::from_file(&config_path).ok().and_then(|c| c.api) {
        Some(api_config) => {
            let api = ApiServer::start(&api_config, supervisor.clone())?;
            println!("Status at http://{}/api/v1/mcp/status", api.local_addr());
            Some(api)
        }
        None => None,
    };

    println!("\n=== Server status ===");
    println!("{}", serde_json::to_string_pretty(&supervisor.status())?);

    println!("\nPress Ctrl+C to stop");
    hooks.shutdown_requested().await;

    if let Some(api) = api {
        api.shutdown().await;
    }
    if let Err(e) = supervisor.shutdown().await {
        tracing::warn!(error = %e, "Some servers did not stop cleanly");
    }

    println!("All tool servers stopped");
    Ok(())
}
