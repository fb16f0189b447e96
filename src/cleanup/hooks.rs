//! Shutdown hooks that drive the cleanup registry.
//!
//! Signal delivery only flags intent: tokio's signal driver records the
//! signal and wakes a task, and that task performs the actual process
//! operations outside of signal context. Normal exit and unwinding out of
//! `main` are covered by dropping the [`CleanupHooks`] guard.

use crate::cleanup::CleanupRegistry;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether a termination signal has been received by this process.
///
/// Once set, supervisors refuse to start servers and health monitors stop,
/// so nothing respawns what the cleanup pass terminated.
pub fn termination_requested() -> bool {
    TERMINATION_REQUESTED.load(Ordering::SeqCst)
}

/// Completes when the process receives a termination signal.
///
/// On Unix: SIGINT, SIGTERM and SIGQUIT, with ctrl-c as a fallback.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Completes when the process receives ctrl-c.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Guard returned by [`install_cleanup_hooks`].
///
/// Keep it alive for the lifetime of the host (typically as a local in
/// `main`). Dropping it runs a final cleanup pass.
pub struct CleanupHooks {
    registry: Arc<CleanupRegistry>,
    signal_task: Option<JoinHandle<()>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CleanupHooks {
    /// Completes once a termination signal was received and the cleanup
    /// pass it triggered has finished.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_rx.clone();
        // a closed channel means the signal task is gone; treat as shutdown
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// The registry these hooks clean up.
    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.registry
    }
}

impl Drop for CleanupHooks {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        if std::thread::panicking() {
            tracing::error!("Host is unwinding, terminating tool server processes");
        }
        self.registry.terminate_all();
    }
}

/// Registers the cleanup paths for `registry` exactly once per process.
///
/// Must be called from within a tokio runtime. A second call fails with
/// [`Error::HooksAlreadyInstalled`] and leaves the first installation intact.
pub fn install_cleanup_hooks(registry: Arc<CleanupRegistry>) -> Result<CleanupHooks> {
    if INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(Error::HooksAlreadyInstalled);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task_registry = Arc::clone(&registry);
    let signal_task = tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "Could not listen for shutdown signals");
            return;
        }
        TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
        tracing::info!("Termination signal received, cleaning up tool server processes");
        task_registry.terminate_all_async().await;
        let _ = shutdown_tx.send(true);
    });

    tracing::debug!("Registered process cleanup hooks");
    Ok(CleanupHooks {
        registry,
        signal_task: Some(signal_task),
        shutdown_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hooks_install_once() {
        let registry = Arc::new(CleanupRegistry::new());
        let hooks = install_cleanup_hooks(Arc::clone(&registry)).unwrap();

        let second = install_cleanup_hooks(registry);
        assert!(matches!(second, Err(Error::HooksAlreadyInstalled)));
        assert!(!termination_requested());

        drop(hooks);
    }
}
