/*!
 # MCP Supervisor

 A Rust library for supervising external tool-server processes.

 ## Overview

 MCP Supervisor provides functionality to:
 - Start tool servers declared in configuration and wait until they answer
 - Adopt a server that already answers on its port instead of launching a duplicate
 - Monitor server health and restart servers that stop answering
 - Stop servers gracefully, escalating to a force kill
 - Guarantee through a process-wide cleanup registry that no child outlives the host
 - Optionally expose server status over HTTP

 ## Basic Usage

 ```no_run
 use mcp_supervisor::cleanup::{CleanupRegistry, install_cleanup_hooks};
 use mcp_supervisor::{McpSupervisor, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     let hooks = install_cleanup_hooks(CleanupRegistry::global())?;

     // Create a supervisor from a config file
     let supervisor = McpSupervisor::from_config_file("config/mcp_servers.yaml")?;

     // Start every enabled server, one after another
     let results = supervisor.start_all_enabled().await?;
     println!("Started: {:?}", results);

     // Keep them healthy
     supervisor.start_health_monitor().await;

     // Report status
     for (name, report) in supervisor.status() {
         println!("{}: {} on port {}", name, report.status, report.port);
     }

     hooks.shutdown_requested().await;
     supervisor.shutdown().await?;
     Ok(())
 }
 ```

 ## Features

 - **Lifecycle Management**: Start, stop and restart servers through a checked state machine
 - **Health Monitoring**: Periodic probes with automatic recovery
 - **Leak Protection**: Escalating termination of every spawned process group on shutdown
 - **Configuration**: Configure servers through YAML config files
 - **Status API**: Optional actix-web surface for operators
*/

pub mod api;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod server;
pub mod status;

pub use cleanup::{CleanupRegistry, install_cleanup_hooks};
pub use config::{Config, DefinitionSource, ServerDefinition};
pub use error::{Error, Result};
pub use server::{ServerEvent, ServerStatus};
pub use status::ServerStatusReport;

use async_trait::async_trait;
use config::{SupervisorSettings, parse_definitions, validate_config};
use server::{
    HealthProbe, HttpProbe, MonitorTarget, MonitoredServer, ProcessHandle, ProcessLauncher,
    ServerLifecycleEvent, ServerLifecycleManager, ServerMonitor, ServerMonitorConfig, ServerSlot,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::{self, Instant};

/// Supervise tool-server processes
///
/// This struct is the main entry point for managing tool-server lifecycles.
/// It is cheap to clone; clones share the same servers.
/// All public methods are instrumented with `tracing` spans.
#[derive(Clone)]
pub struct McpSupervisor {
    shared: Arc<Shared>,
}

struct Shared {
    /// Where definitions are reloaded from
    source: DefinitionSource,
    /// Settings of the most recent load
    settings: RwLock<SupervisorSettings>,
    /// Definitions of the most recent load
    definitions: RwLock<HashMap<String, ServerDefinition>>,
    /// Runtime state and event history
    lifecycle: ServerLifecycleManager,
    /// Process launcher
    launcher: RwLock<ProcessLauncher>,
    /// Liveness probe
    probe: Arc<dyn HealthProbe>,
    /// Cleanup registry every spawned process is tracked in
    registry: Arc<CleanupRegistry>,
    /// Health monitor
    monitor: tokio::sync::Mutex<ServerMonitor>,
}

impl McpSupervisor {
    /// Create a new supervisor from a configuration file path
    ///
    /// `start_all_enabled` re-reads the file, so edits take effect on the
    /// next call. A missing file yields a supervisor with no servers.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let source = DefinitionSource::File(path.as_ref().to_path_buf());
        let config = source.load()?;
        Ok(Self::build(source, config, CleanupRegistry::global(), None))
    }

    /// Create a new supervisor from a configuration string
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config))]
    pub fn from_config_str(config: &str) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = Config::parse_from_str(config)?;
        Ok(Self::new(config))
    }

    /// Create a new supervisor from a configuration
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config), fields(num_servers = config.mcp_servers.len()))]
    pub fn new(config: Config) -> Self {
        let source = DefinitionSource::Inline(Box::new(config.clone()));
        Self::build(source, config, CleanupRegistry::global(), None)
    }

    /// Create a supervisor with an explicit cleanup registry and probe
    ///
    /// Useful to isolate supervisors from each other, mostly in tests.
    pub fn with_components(
        source: DefinitionSource,
        registry: Arc<CleanupRegistry>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        let config = source.load()?;
        Ok(Self::build(source, config, registry, Some(probe)))
    }

    fn build(
        source: DefinitionSource,
        config: Config,
        registry: Arc<CleanupRegistry>,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Self {
        if let Err(e) = validate_config(&config) {
            tracing::warn!(error = %e, "Configuration has problems");
        }

        let settings = config.supervisor.clone();
        let probe = probe.unwrap_or_else(|| Arc::new(HttpProbe::new(&settings.health)));
        let monitor = ServerMonitor::new(ServerMonitorConfig::from(&settings.monitor));
        let launcher = ProcessLauncher::new(settings.clone(), Arc::clone(&registry));

        tracing::info!(num_servers = config.mcp_servers.len(), "Creating new McpSupervisor");
        Self {
            shared: Arc::new(Shared {
                source,
                definitions: RwLock::new(parse_definitions(&config)),
                settings: RwLock::new(settings),
                lifecycle: ServerLifecycleManager::new(),
                launcher: RwLock::new(launcher),
                probe,
                registry,
                monitor: tokio::sync::Mutex::new(monitor),
            }),
        }
    }

    /// Start a server
    ///
    /// Waits for a concurrent stop of the same server; fails fast with
    /// `Error::AlreadyStarting` if another start is still in progress.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn start(&self, name: &str) -> Result<()> {
        self.shared.start(name).await
    }

    /// Stop a server
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.shared.stop(name).await
    }

    /// Stop a server and start it again
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.shared.restart(name).await
    }

    /// Reload definitions and start every enabled server sequentially
    ///
    /// Returns whether each enabled server started. One failure never aborts
    /// the others; only an unreadable configuration is an error.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn start_all_enabled(&self) -> Result<HashMap<String, bool>> {
        tracing::info!("Starting all enabled servers");
        self.reload()?;

        let mut names: Vec<String> = self
            .shared
            .definitions()
            .values()
            .filter(|d| d.enabled)
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        tracing::debug!(servers_to_start = ?names);

        let mut results = HashMap::new();
        for name in names {
            let started = match self.start(&name).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(server_name = %name, error = %e, "Failed to start server");
                    false
                }
            };
            results.insert(name, started);
        }

        let failed = results.values().filter(|ok| !**ok).count();
        if failed > 0 {
            tracing::warn!(num_failed = failed, "Some servers failed to start");
        }
        tracing::info!(num_started = results.len() - failed, "Finished starting servers");
        Ok(results)
    }

    /// Re-read definitions from the source
    ///
    /// Runtime state of servers that disappeared is kept, so they can still be
    /// reported and stopped.
    #[tracing::instrument(skip(self))]
    pub fn reload(&self) -> Result<()> {
        let config = self.shared.source.load()?;
        if let Err(e) = validate_config(&config) {
            tracing::warn!(error = %e, "Configuration has problems");
        }

        let definitions = parse_definitions(&config);
        tracing::debug!(num_servers = definitions.len(), "Reloaded server definitions");

        *self
            .shared
            .launcher
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            ProcessLauncher::new(config.supervisor.clone(), Arc::clone(&self.shared.registry));
        *self
            .shared
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config.supervisor;
        *self
            .shared
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner) = definitions;
        Ok(())
    }

    /// Stop the health monitor, then every known server
    ///
    /// Every server is attempted; errors are collected.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all(&self) -> Result<()> {
        tracing::info!("Stopping all servers");
        self.stop_health_monitor().await;

        let mut names: Vec<String> = self.shared.definitions().keys().cloned().collect();
        for slot in self.shared.lifecycle.slots() {
            if !names.iter().any(|n| n == slot.name()) {
                names.push(slot.name().to_string());
            }
        }
        names.sort();

        let mut errors = Vec::new();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::error!(server_name = %name, error = %e, "Failed to stop server");
                errors.push((name, e));
            }
        }

        let pruned = self.shared.registry.prune();
        tracing::debug!(pruned, "Pruned exited processes from cleanup registry");

        if errors.is_empty() {
            tracing::info!("All servers stopped successfully");
            return Ok(());
        }

        tracing::warn!(error_count = errors.len(), "Some servers failed to stop");
        if errors.len() == 1 {
            Err(errors.remove(0).1)
        } else {
            let error_msg = errors
                .iter()
                .map(|(name, e)| format!("{}: {}", name, e))
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::Other(format!(
                "Multiple servers failed to stop: {}",
                error_msg
            )))
        }
    }

    /// Stop everything and run a final cleanup pass over the registry
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.stop_all().await;
        self.shared.registry.terminate_all_async().await;
        tracing::info!("Supervisor shut down");
        result
    }

    /// Start the health monitor
    ///
    /// Returns whether the monitor is running afterwards; it stays off when
    /// disabled in configuration. Calling this again is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn start_health_monitor(&self) -> bool {
        if !self.shared.settings().monitor.enabled {
            tracing::info!("Health monitor disabled by configuration");
            return false;
        }

        let mut monitor = self.shared.monitor.lock().await;
        monitor.start(Arc::downgrade(&self.shared));
        monitor.is_running()
    }

    /// Stop the health monitor
    pub async fn stop_health_monitor(&self) {
        self.shared.monitor.lock().await.stop().await;
    }

    /// Whether the health monitor is running
    pub async fn is_monitoring(&self) -> bool {
        self.shared.monitor.lock().await.is_running()
    }

    /// Status of every defined server, plus servers that only survive as
    /// runtime state after a reload removed them
    pub fn status(&self) -> BTreeMap<String, ServerStatusReport> {
        let definitions = self.shared.definitions();
        let mut reports = BTreeMap::new();

        for (name, definition) in &definitions {
            let state = self.shared.lifecycle.existing(name).map(|s| s.snapshot());
            reports.insert(
                name.clone(),
                ServerStatusReport::new(definition, state.as_ref()),
            );
        }
        for slot in self.shared.lifecycle.slots() {
            if !definitions.contains_key(slot.name()) {
                reports.insert(
                    slot.name().to_string(),
                    ServerStatusReport::orphaned(&slot.snapshot()),
                );
            }
        }

        reports
    }

    /// Status of one server
    pub fn server_status(&self, name: &str) -> Result<ServerStatus> {
        match self.shared.lifecycle.existing(name) {
            Some(slot) => Ok(slot.status()),
            None if self.shared.definitions().contains_key(name) => Ok(ServerStatus::Stopped),
            None => Err(Error::ServerNotFound(name.to_string())),
        }
    }

    /// Pid of a server's live process
    pub fn server_pid(&self, name: &str) -> Option<u32> {
        self.shared
            .lifecycle
            .existing(name)
            .and_then(|slot| slot.state().live_process().map(ProcessHandle::pid))
    }

    /// Recent lifecycle events of a server, newest first
    pub fn events(&self, name: &str, limit: Option<usize>) -> Vec<ServerEvent> {
        self.shared.lifecycle.get_server_events(name, limit)
    }

    /// Current server definitions
    pub fn definitions(&self) -> HashMap<String, ServerDefinition> {
        self.shared.definitions()
    }

    /// The cleanup registry this supervisor tracks processes in
    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.shared.registry
    }
}

impl Shared {
    fn settings(&self) -> SupervisorSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn definitions(&self) -> HashMap<String, ServerDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn definition(&self, name: &str) -> Result<ServerDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                tracing::warn!(server_name = %name, "Unknown server");
                Error::ServerNotFound(name.to_string())
            })
    }

    fn launcher(&self) -> ProcessLauncher {
        self.launcher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn start(&self, name: &str) -> Result<()> {
        let definition = self.definition(name)?;
        if !definition.enabled {
            tracing::warn!("Start requested for a disabled server");
            return Err(Error::ServerDisabled(name.to_string()));
        }

        let slot = self.lifecycle.slot(name);
        let _op = match slot.op_lock().try_lock() {
            Ok(guard) => guard,
            Err(_) if slot.status() == ServerStatus::Starting => {
                tracing::warn!("Start already in progress");
                return Err(Error::AlreadyStarting(name.to_string()));
            }
            Err(_) => slot.op_lock().lock().await,
        };

        self.start_locked(&slot, definition).await
    }

    async fn start_locked(&self, slot: &ServerSlot, definition: ServerDefinition) -> Result<()> {
        if cleanup::termination_requested() {
            tracing::warn!("Termination requested, refusing to start server");
            return Err(Error::ShuttingDown);
        }

        let (status, live) = {
            let state = slot.state();
            (state.status, state.live_process().cloned())
        };

        if let Some(process) = live {
            let mut status = status;
            if status == ServerStatus::Running {
                if self.probe.probe(&definition.host, definition.port).await {
                    tracing::debug!(pid = process.pid(), "Server already running");
                    return Ok(());
                }
                tracing::warn!(pid = process.pid(), "Running server no longer answers");
                self.lifecycle.transition(
                    slot,
                    ServerLifecycleEvent::Failed,
                    Some("server no longer answering".to_string()),
                    |state| state.last_error = Some("server no longer answering".to_string()),
                )?;
                status = ServerStatus::Failed;
            }
            tracing::info!(pid = process.pid(), "Resuming startup of a live process");
            if status != ServerStatus::Starting {
                self.lifecycle.transition(
                    slot,
                    ServerLifecycleEvent::Starting,
                    Some(format!("resuming pid {}", process.pid())),
                    |state| state.last_error = None,
                )?;
            }
            return self.await_healthy(slot, &definition, process).await;
        }

        self.discard_dead_process(slot);

        if self.probe.probe(&definition.host, definition.port).await {
            if status == ServerStatus::Running {
                tracing::debug!("Server already running");
                return Ok(());
            }
            let address = format!("{}:{}", definition.host, definition.port);
            tracing::info!(address = %address, "Port already answers, adopting server without launching");
            return self.lifecycle.transition(
                slot,
                ServerLifecycleEvent::Adopted,
                Some(format!("{} already answering", address)),
                |state| {
                    state.last_error = None;
                    state.definition = Some(definition.clone());
                },
            );
        }

        if status == ServerStatus::Running {
            self.lifecycle.transition(
                slot,
                ServerLifecycleEvent::Failed,
                Some("server no longer answering".to_string()),
                |state| state.last_error = Some("server no longer answering".to_string()),
            )?;
        }

        self.lifecycle.transition(
            slot,
            ServerLifecycleEvent::Starting,
            None,
            |state| {
                state.last_error = None;
                state.definition = Some(definition.clone());
            },
        )?;

        tracing::info!("Launching server process");
        let process = match self.launcher().spawn(&definition).await {
            Ok(process) => process,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "Failed to launch server");
                self.lifecycle.transition(
                    slot,
                    ServerLifecycleEvent::Failed,
                    Some(message.clone()),
                    |state| state.last_error = Some(message),
                )?;
                return Err(e);
            }
        };
        slot.state().process = Some(process.clone());

        self.await_healthy(slot, &definition, process).await
    }

    /// Polls until the process answers, exits, or the startup bound passes.
    async fn await_healthy(
        &self,
        slot: &ServerSlot,
        definition: &ServerDefinition,
        process: ProcessHandle,
    ) -> Result<()> {
        let startup = self.settings().startup;
        let deadline = Instant::now() + startup.timeout();
        let mut guard = StartGuard::new(&self.lifecycle, slot);

        loop {
            match process.try_exit_status() {
                Ok(Some(exit_status)) => {
                    guard.disarm();
                    let output = process.final_output().await;
                    let message = if output.is_empty() {
                        format!("process exited with {}", exit_status)
                    } else {
                        output
                    };
                    self.registry.forget(process.tracking_id());
                    tracing::error!(pid = process.pid(), error = %message, "Server exited during startup");
                    self.lifecycle.transition(
                        slot,
                        ServerLifecycleEvent::Failed,
                        Some(message.clone()),
                        |state| {
                            state.process = None;
                            state.last_error = Some(message.clone());
                        },
                    )?;
                    return Err(Error::Process(format!(
                        "{} exited during startup: {}",
                        definition.name, message
                    )));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Could not query server process"),
            }

            if self.probe.probe(&definition.host, definition.port).await {
                guard.disarm();
                tracing::info!(pid = process.pid(), "Server is healthy");
                return self.lifecycle.transition(
                    slot,
                    ServerLifecycleEvent::Started,
                    None,
                    |state| state.last_error = None,
                );
            }

            if Instant::now() >= deadline {
                break;
            }
            time::sleep(startup.poll_interval()).await;
        }

        guard.disarm();
        tracing::warn!(
            pid = process.pid(),
            timeout_ms = startup.timeout_ms,
            "Server did not answer within the startup timeout, assuming it is still warming up"
        );
        self.lifecycle.transition(
            slot,
            ServerLifecycleEvent::AssumedRunning,
            Some(format!("no answer within {} ms", startup.timeout_ms)),
            |state| state.last_error = None,
        )
    }

    /// Drops a handle whose process has exited, along with its registry entry.
    fn discard_dead_process(&self, slot: &ServerSlot) {
        let mut state = slot.state();
        if let Some(process) = state.process.take_if(|p| !p.is_alive()) {
            tracing::debug!(pid = process.pid(), "Discarding exited process");
            self.registry.forget(process.tracking_id());
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let slot = match self.lifecycle.existing(name) {
            Some(slot) => slot,
            None => {
                self.definition(name)?;
                tracing::debug!("Server was never started");
                return Ok(());
            }
        };

        let _op = slot.op_lock().lock().await;
        self.discard_dead_process(&slot);

        let (status, process) = {
            let state = slot.state();
            (state.status, state.process.clone())
        };

        let Some(process) = process else {
            if status != ServerStatus::Stopped {
                self.lifecycle.transition(
                    &slot,
                    ServerLifecycleEvent::Stopped,
                    None,
                    |_| {},
                )?;
            }
            tracing::debug!("No live process to stop");
            return Ok(());
        };

        tracing::info!(pid = process.pid(), "Stopping server");
        let control = self.registry.control();
        let grace = self.settings().stop_grace();

        match process.stop(control.as_ref(), grace).await {
            Ok(()) => {
                self.registry.forget(process.tracking_id());
                self.lifecycle.transition(
                    &slot,
                    ServerLifecycleEvent::Stopped,
                    Some(format!("pid {} terminated", process.pid())),
                    |state| state.process = None,
                )?;
                tracing::info!("Server stopped");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "Server did not stop");
                if status != ServerStatus::Stopped {
                    self.lifecycle.transition(
                        &slot,
                        ServerLifecycleEvent::Failed,
                        Some(message.clone()),
                        |state| state.last_error = Some(message),
                    )?;
                }
                Err(e)
            }
        }
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }
}

#[async_trait]
impl MonitorTarget for Shared {
    fn monitored_servers(&self) -> Vec<MonitoredServer> {
        self.definitions()
            .into_values()
            .filter(|d| d.enabled)
            .filter_map(|d| {
                let slot = self.lifecycle.existing(&d.name)?;
                let status = slot.status();
                if matches!(status, ServerStatus::Stopped | ServerStatus::Starting) || slot.is_busy()
                {
                    return None;
                }
                Some(MonitoredServer {
                    name: d.name,
                    host: d.host,
                    port: d.port,
                    status,
                })
            })
            .collect()
    }

    async fn probe(&self, server: &MonitoredServer) -> bool {
        self.probe.probe(&server.host, server.port).await
    }

    fn mark_recovered(&self, name: &str) -> bool {
        let Some(slot) = self.lifecycle.existing(name) else {
            return false;
        };
        self.lifecycle
            .transition_from(
                &slot,
                ServerStatus::Failed,
                ServerLifecycleEvent::Recovered,
                Some("health check passed".to_string()),
                |state| state.last_error = None,
            )
            .unwrap_or(false)
    }

    fn mark_failed(&self, name: &str, reason: &str) -> bool {
        let Some(slot) = self.lifecycle.existing(name) else {
            return false;
        };
        self.lifecycle
            .transition_from(
                &slot,
                ServerStatus::Running,
                ServerLifecycleEvent::Failed,
                Some(reason.to_string()),
                |state| state.last_error = Some(reason.to_string()),
            )
            .unwrap_or(false)
    }

    async fn restart(&self, name: &str) -> Result<()> {
        Shared::restart(self, name).await
    }
}

/// Marks a start as interrupted if its future is dropped mid-poll.
///
/// The process handle stays in the runtime state, so the next start adopts it
/// and the next stop terminates it.
struct StartGuard<'a> {
    lifecycle: &'a ServerLifecycleManager,
    slot: &'a ServerSlot,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    fn new(lifecycle: &'a ServerLifecycleManager, slot: &'a ServerSlot) -> Self {
        Self {
            lifecycle,
            slot,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(server_name = %self.slot.name(), "Start interrupted");
        let _ = self.lifecycle.transition(
            self.slot,
            ServerLifecycleEvent::Failed,
            Some("start interrupted".to_string()),
            |state| state.last_error = Some("start interrupted".to_string()),
        );
    }
}
