use crate::server::control::{self, ProcessControl};
use async_process::Child;
use std::cell::Cell;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

/// Wait after the graceful group signal.
const GROUP_TERM_WAIT: Duration = Duration::from_millis(500);
/// Wait after the single-process termination signal.
const PROCESS_TERM_WAIT: Duration = Duration::from_millis(500);
/// Final wait after the force kill.
const KILL_WAIT: Duration = Duration::from_secs(1);
/// Liveness polling granularity while waiting.
const POLL_STEP: Duration = Duration::from_millis(50);

static GLOBAL: LazyLock<Arc<CleanupRegistry>> = LazyLock::new(|| Arc::new(CleanupRegistry::new()));

thread_local! {
    static IN_PASS: Cell<bool> = const { Cell::new(false) };
}

/// A registry-only reference to a spawned process.
///
/// The child handle is held weakly: the entry never keeps a process handle
/// alive, it only remembers enough to find and terminate the process later.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    /// Entry identifier, shared with the owning `ProcessHandle`.
    pub id: Uuid,
    /// Operating-system process id (also the process group id).
    pub pid: u32,
    /// When the process was registered.
    pub discovered_at: SystemTime,
    child: Weak<Mutex<Child>>,
}

impl TrackedProcess {
    /// Creates an entry for a freshly spawned child.
    pub fn new(pid: u32, child: &Arc<Mutex<Child>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid,
            discovered_at: SystemTime::now(),
            child: Arc::downgrade(child),
        }
    }

    /// Whether the process is still running.
    ///
    /// Uses the child handle while its owner keeps it alive (this also reaps
    /// an exited child). Otherwise the pid only counts while it still leads
    /// its own process group, so a recycled pid is never signalled.
    pub fn is_alive(&self, control: &dyn ProcessControl) -> bool {
        if let Some(child) = self.child.upgrade() {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            match child.try_status() {
                Ok(Some(_)) => return false,
                Ok(None) => return true,
                Err(e) => {
                    tracing::debug!(pid = self.pid, error = %e, "Could not query child status, checking pid");
                }
            }
        }
        control.leads_group(self.pid)
    }
}

/// Process-wide ledger of every spawned tool-server process.
///
/// The registry outlives any single supervisor so that a process can be
/// terminated even after the runtime state that spawned it is gone. Its one
/// destructive operation, [`terminate_all`](Self::terminate_all), is
/// idempotent and may be invoked from several shutdown paths at once.
pub struct CleanupRegistry {
    entries: Mutex<Vec<TrackedProcess>>,
    pass: Mutex<()>,
    control: Arc<dyn ProcessControl>,
}

impl CleanupRegistry {
    /// Creates an empty registry using the platform process control.
    pub fn new() -> Self {
        Self::with_control(control::platform())
    }

    /// Creates an empty registry with a specific process control backend.
    pub fn with_control(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            pass: Mutex::new(()),
            control,
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<CleanupRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// The process control backend used by this registry.
    pub fn control(&self) -> Arc<dyn ProcessControl> {
        Arc::clone(&self.control)
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<TrackedProcess>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a spawned process.
    pub fn track(&self, entry: TrackedProcess) {
        tracing::debug!(pid = entry.pid, entry_id = %entry.id, "Tracking spawned process");
        self.lock_entries().push(entry);
    }

    /// Drops an entry whose termination has been confirmed by its owner.
    pub fn forget(&self, id: Uuid) -> bool {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        before != entries.len()
    }

    /// Snapshot of the tracked entries.
    pub fn entries(&self) -> Vec<TrackedProcess> {
        self.lock_entries().clone()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Pids of tracked processes that are still running.
    pub fn live_pids(&self) -> Vec<u32> {
        self.entries()
            .into_iter()
            .filter(|e| e.is_alive(self.control.as_ref()))
            .map(|e| e.pid)
            .collect()
    }

    /// Removes entries whose process has already exited.
    pub fn prune(&self) -> usize {
        let dead: Vec<Uuid> = self
            .entries()
            .into_iter()
            .filter(|e| !e.is_alive(self.control.as_ref()))
            .map(|e| e.id)
            .collect();
        for id in &dead {
            self.forget(*id);
        }
        dead.len()
    }

    /// Terminates every tracked process, escalating until it is gone.
    ///
    /// Blocking. Passes are serialized: a concurrent caller waits for the
    /// running pass and then finds nothing left to do. A reentrant call on the
    /// same thread returns immediately. Failures are logged, never returned.
    pub fn terminate_all(&self) {
        if IN_PASS.with(Cell::get) {
            tracing::debug!("terminate_all re-entered, skipping");
            return;
        }
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        IN_PASS.with(|flag| flag.set(true));

        let entries = self.entries();
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Cleaning up tool server processes");
        }

        for entry in entries {
            if entry.is_alive(self.control.as_ref()) {
                tracing::info!(pid = entry.pid, "Terminating process");
                if !self.escalate(&entry) {
                    tracing::warn!(pid = entry.pid, "Process survived every termination attempt");
                }
            }
            self.forget(entry.id);
        }

        IN_PASS.with(|flag| flag.set(false));
    }

    /// Runs [`terminate_all`](Self::terminate_all) on the blocking pool.
    pub async fn terminate_all_async(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || registry.terminate_all()).await {
            tracing::error!(error = %e, "Cleanup pass panicked");
        }
    }

    /// Returns whether the process is confirmed dead.
    fn escalate(&self, entry: &TrackedProcess) -> bool {
        let control = self.control.as_ref();
        let pid = entry.pid;

        if let Err(e) = control.terminate_group(pid) {
            tracing::debug!(pid, error = %e, "Graceful group termination failed");
        }
        if self.wait_for_exit(entry, GROUP_TERM_WAIT) {
            return true;
        }

        if let Err(e) = control.terminate(pid) {
            tracing::debug!(pid, error = %e, "Process termination failed");
        }
        if self.wait_for_exit(entry, PROCESS_TERM_WAIT) {
            return true;
        }

        if let Err(e) = control.kill_group(pid) {
            tracing::debug!(pid, error = %e, "Group kill failed");
        }
        if let Err(e) = control.kill(pid) {
            tracing::debug!(pid, error = %e, "Process kill failed");
        }
        self.wait_for_exit(entry, KILL_WAIT)
    }

    fn wait_for_exit(&self, entry: &TrackedProcess, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            if !entry.is_alive(self.control.as_ref()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_STEP);
        }
    }
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
