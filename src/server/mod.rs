/// Server management module for the MCP supervisor.
///
/// This module handles launching, probing, monitoring and stopping tool
/// server processes. The state machine lives in `lifecycle`; the supervisor
/// at the crate root drives it.
/// All public operations are instrumented with `tracing` spans.
///
/// # Components
///
/// * `control` - Platform signalling of processes and process groups
/// * `health` - HTTP liveness probe
/// * `lifecycle` - Server statuses, runtime state and lifecycle events
/// * `monitor` - Periodic health checks and automatic restarts
/// * `process` - Spawning server processes and stopping them
///
/// # Examples
///
/// Recording lifecycle events:
///
/// ```
/// use mcp_supervisor::server::{ServerLifecycleEvent, ServerLifecycleManager, ServerStatus};
///
/// let manager = ServerLifecycleManager::new();
/// let slot = manager.slot("elasticsearch");
///
/// manager.record_event(&slot, ServerLifecycleEvent::Starting, None).unwrap();
/// manager
///     .record_event(&slot, ServerLifecycleEvent::Started, Some("healthy".to_string()))
///     .unwrap();
///
/// assert_eq!(slot.status(), ServerStatus::Running);
/// ```
///
/// Probing a server:
///
/// ```no_run
/// use mcp_supervisor::server::{HealthProbe, HttpProbe};
///
/// # async fn example() {
/// let probe = HttpProbe::default();
/// let alive = probe.probe("localhost", 8082).await;
/// println!("elasticsearch bridge alive: {}", alive);
/// # }
/// ```
pub mod control;
pub mod health;
pub mod lifecycle;
pub mod monitor;
mod process;

pub use control::ProcessControl;
pub use health::{HealthProbe, HttpProbe};
pub use lifecycle::{
    ServerEvent, ServerLifecycleEvent, ServerLifecycleManager, ServerRuntimeState, ServerSlot,
    ServerStatus,
};
pub use monitor::{
    CycleSummary, MonitorTarget, MonitoredServer, ServerMonitor, ServerMonitorConfig,
    run_health_cycle,
};
pub use process::{OUTPUT_TAIL_BYTES, OutputTail, ProcessHandle, ProcessLauncher};
