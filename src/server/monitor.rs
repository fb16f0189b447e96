use crate::cleanup::termination_requested;
use crate::config::MonitorSettings;
use crate::error::Result;
use crate::server::ServerStatus;
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

/// Server monitor configuration
#[derive(Debug, Clone)]
pub struct ServerMonitorConfig {
    /// Check interval
    pub check_interval: Duration,
    /// How long `stop` lets an in-flight cycle finish before aborting it
    pub shutdown_grace: Duration,
}

impl Default for ServerMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl From<&MonitorSettings> for ServerMonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            check_interval: Duration::from_secs(settings.interval_secs),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }
}

/// A server the monitor should look at in this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredServer {
    /// Server name
    pub name: String,
    /// Probe host
    pub host: String,
    /// Probe port
    pub port: u16,
    /// Status when the cycle started
    pub status: ServerStatus,
}

/// What the monitor needs from a supervisor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MonitorTarget: Send + Sync {
    /// Servers that are enabled, not stopped and not mid-operation.
    fn monitored_servers(&self) -> Vec<MonitoredServer>;

    /// Probes one server.
    async fn probe(&self, server: &MonitoredServer) -> bool;

    /// Moves a non-running server to `Running`; returns whether it changed.
    fn mark_recovered(&self, name: &str) -> bool;

    /// Moves a running server to `Failed`; returns whether it changed.
    fn mark_failed(&self, name: &str, reason: &str) -> bool;

    /// Replaces the server's process through the normal start path.
    async fn restart(&self, name: &str) -> Result<()>;
}

/// Outcome counters of one health cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Servers probed
    pub checked: usize,
    /// Servers moved back to running
    pub recovered: usize,
    /// Restart attempts made
    pub restarts: usize,
    /// Restart attempts that failed
    pub restart_failures: usize,
}

/// Runs one health cycle over every monitored server.
///
/// Healthy but not running → running. Unhealthy while running → failed,
/// followed by exactly one restart attempt. A failing server never stops the
/// cycle for the others. Once the host received a termination signal the
/// cycle stops acting.
pub async fn run_health_cycle<T>(target: &T) -> CycleSummary
where
    T: MonitorTarget + ?Sized,
{
    let mut summary = CycleSummary::default();

    for server in target.monitored_servers() {
        if termination_requested() {
            tracing::debug!("Termination requested, ending health cycle");
            break;
        }
        summary.checked += 1;
        let healthy = target.probe(&server).await;

        if healthy {
            if server.status != ServerStatus::Running && target.mark_recovered(&server.name) {
                summary.recovered += 1;
                tracing::info!(server_name = %server.name, "Server is healthy again");
            }
            continue;
        }

        if server.status != ServerStatus::Running {
            continue;
        }
        if !target.mark_failed(&server.name, "health check failed") {
            continue;
        }

        tracing::warn!(server_name = %server.name, "Health check failed, restarting server");
        summary.restarts += 1;
        match target.restart(&server.name).await {
            Ok(()) => tracing::info!(server_name = %server.name, "Server restarted"),
            Err(e) => {
                summary.restart_failures += 1;
                tracing::error!(server_name = %server.name, error = %e, "Restart failed");
            }
        }
    }

    summary
}

/// Server monitor
///
/// Runs [`run_health_cycle`] on a fixed interval in a background task until
/// stopped or until its target is dropped.
pub struct ServerMonitor {
    /// Monitor configuration
    config: ServerMonitorConfig,
    /// Monitor task
    monitor_task: Option<JoinHandle<()>>,
    /// Shutdown signal for the task
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl ServerMonitor {
    /// Create a new server monitor
    pub fn new(config: ServerMonitorConfig) -> Self {
        Self {
            config,
            monitor_task: None,
            shutdown_tx: None,
        }
    }

    /// Whether the background task is running
    pub fn is_running(&self) -> bool {
        self.monitor_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start the monitor; a no-op if it is already running
    pub fn start<T>(&mut self, target: Weak<T>)
    where
        T: MonitorTarget + 'static,
    {
        if self.is_running() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.check_interval;

        let task = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Health monitor started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = time::sleep(interval) => {}
                }

                if termination_requested() {
                    tracing::info!("Termination requested, leaving servers to the cleanup pass");
                    break;
                }
                let Some(target) = target.upgrade() else {
                    break;
                };
                let summary = run_health_cycle(target.as_ref()).await;
                tracing::debug!(?summary, "Health cycle finished");
            }
            tracing::info!("Health monitor stopped");
        });

        self.monitor_task = Some(task);
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Stop the monitor
    ///
    /// An in-flight cycle gets the configured grace period to finish before
    /// the task is aborted.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        if let Some(mut task) = self.monitor_task.take() {
            if time::timeout(self.config.shutdown_grace, &mut task).await.is_err() {
                tracing::warn!("Health cycle did not finish in time, aborting monitor");
                task.abort();
            }
        }
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
    }
}
