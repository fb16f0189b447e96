// src/server/process.rs
use crate::cleanup::{CleanupRegistry, TrackedProcess};
use crate::config::{ServerDefinition, SupervisorSettings};
use crate::error::{Error, Result};
use crate::server::control::ProcessControl;
use async_process::{Child, Command, Stdio};
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{self, Instant};
use uuid::Uuid;

/// Number of trailing output bytes kept per process.
pub const OUTPUT_TAIL_BYTES: usize = 500;

/// Bound on the wait after a force kill.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);
/// Exit polling granularity during a stop.
const EXIT_POLL_STEP: Duration = Duration::from_millis(100);
/// How long an exited process's pipes get to drain before its output is read.
const OUTPUT_SETTLE: Duration = Duration::from_millis(250);

/// Bounded buffer holding the most recent output of a process.
#[derive(Clone, Default)]
pub struct OutputTail {
    buf: Arc<Mutex<VecDeque<u8>>>,
    open_streams: Arc<AtomicUsize>,
}

impl OutputTail {
    /// Appends a line, discarding the oldest bytes beyond the bound.
    pub fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        buf.extend(line.as_bytes());
        buf.push_back(b'\n');
        let excess = buf.len().saturating_sub(OUTPUT_TAIL_BYTES);
        buf.drain(..excess);
    }

    /// Current contents, lossily decoded and trimmed.
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes: Vec<u8> = buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).trim().to_string()
    }

    /// Whether every stream feeding this tail reached EOF.
    pub fn is_drained(&self) -> bool {
        self.open_streams.load(Ordering::Acquire) == 0
    }

    fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::AcqRel);
    }

    fn stream_closed(&self) {
        self.open_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for OutputTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputTail").finish_non_exhaustive()
    }
}

/// Handle to a launched tool-server process.
///
/// The runtime state that launched the process owns the handle; the cleanup
/// registry only holds a weak reference to the same child.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    tracking_id: Uuid,
    child: Arc<Mutex<Child>>,
    output: OutputTail,
}

impl ProcessHandle {
    /// Operating-system process id, which is also the process group id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Identifier of this process's cleanup registry entry.
    pub fn tracking_id(&self) -> Uuid {
        self.tracking_id
    }

    /// Exit status if the process has exited, reaping it.
    pub fn try_exit_status(&self) -> Result<Option<ExitStatus>> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child
            .try_status()
            .map_err(|e| Error::Process(format!("Failed to query process {}: {}", self.pid, e)))
    }

    /// Whether the process is still running.
    pub fn is_alive(&self) -> bool {
        matches!(self.try_exit_status(), Ok(None))
    }

    /// The last [`OUTPUT_TAIL_BYTES`] of combined stdout/stderr.
    pub fn trailing_output(&self) -> String {
        self.output.contents()
    }

    /// Trailing output of an exited process, once its pipes are drained.
    ///
    /// Pipes inherited by a surviving grandchild never close, so the wait is
    /// bounded.
    pub async fn final_output(&self) -> String {
        let deadline = Instant::now() + OUTPUT_SETTLE;
        while !self.output.is_drained() && Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        self.output.contents()
    }

    /// Stops the process group: graceful signal, up to `grace` to exit, then
    /// a force kill.
    ///
    /// Returns `Error::Timeout` if the process is still alive after the kill.
    #[tracing::instrument(skip(self, control), fields(pid = self.pid))]
    pub async fn stop(&self, control: &dyn ProcessControl, grace: Duration) -> Result<()> {
        if !self.is_alive() {
            tracing::debug!("Process already exited");
            return Ok(());
        }

        if let Err(e) = control.terminate_group(self.pid) {
            tracing::warn!(error = %e, "Graceful termination failed");
        }
        if self.wait_for_exit(grace).await {
            tracing::debug!("Process exited after graceful termination");
            return Ok(());
        }

        tracing::warn!(grace_ms = grace.as_millis() as u64, "Process ignored termination, killing");
        if let Err(e) = control.kill_group(self.pid) {
            tracing::debug!(error = %e, "Group kill failed");
        }
        if let Err(e) = control.kill(self.pid) {
            tracing::debug!(error = %e, "Process kill failed");
        }
        if self.wait_for_exit(FORCE_KILL_WAIT).await {
            Ok(())
        } else {
            Err(Error::Timeout(format!(
                "process {} still alive after force kill",
                self.pid
            )))
        }
    }

    async fn wait_for_exit(&self, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(EXIT_POLL_STEP).await;
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("tracking_id", &self.tracking_id)
            .finish()
    }
}

/// Spawns tool-server processes.
#[derive(Clone)]
pub struct ProcessLauncher {
    settings: SupervisorSettings,
    registry: Arc<CleanupRegistry>,
}

impl ProcessLauncher {
    /// Create a launcher that registers every child with `registry`
    pub fn new(settings: SupervisorSettings, registry: Arc<CleanupRegistry>) -> Self {
        Self { settings, registry }
    }

    /// Value of the search-path variable with the project root prepended.
    fn search_path(&self) -> OsString {
        let root = self.settings.project_root.clone();
        let mut paths: Vec<PathBuf> = vec![root];
        if let Some(existing) = std::env::var_os(&self.settings.search_path_var) {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).unwrap_or_else(|_| self.settings.project_root.clone().into_os_string())
    }

    fn command(&self, definition: &ServerDefinition, script: &Path) -> Command {
        let mut command = std::process::Command::new(&self.settings.interpreter);
        command.arg(script).current_dir(&self.settings.project_root);

        command.env(&self.settings.search_path_var, self.search_path());
        for (key, value) in definition.env_overlay() {
            command.env(key, value);
        }

        // own process group, so termination reaches the whole subtree
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut command = Command::from(command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// Start the server process described by `definition`
    ///
    /// The child is registered with the cleanup registry before this returns.
    #[tracing::instrument(skip(self, definition), fields(server_name = %definition.name))]
    pub async fn spawn(&self, definition: &ServerDefinition) -> Result<ProcessHandle> {
        let script = definition
            .script_path
            .as_ref()
            .filter(|path| path.is_file())
            .ok_or_else(|| Error::ScriptMissing(definition.name.clone()))?;

        let mut child = self.command(definition, script).spawn().map_err(|e| {
            Error::Launch(format!(
                "{} {}: {}",
                self.settings.interpreter,
                script.display(),
                e
            ))
        })?;

        let pid = child.id();
        let output = OutputTail::default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(child));
        let entry = TrackedProcess::new(pid, &child);
        let tracking_id = entry.id;
        self.registry.track(entry);

        if let Some(stdout) = stdout {
            drain_output(definition.name.clone(), stdout, output.clone());
        }
        if let Some(stderr) = stderr {
            drain_output(definition.name.clone(), stderr, output.clone());
        }

        tracing::info!(pid, script = %script.display(), "Spawned server process");
        Ok(ProcessHandle {
            pid,
            tracking_id,
            child,
            output,
        })
    }
}

/// Reads a child pipe line by line until EOF so the child never blocks on a
/// full pipe or dies of a closed one. Lines are decoded lossily.
fn drain_output<R>(server_name: String, pipe: R, tail: OutputTail)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tail.stream_opened();
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    tracing::debug!(server_name = %server_name, "{}", line);
                    tail.push_line(line);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(server_name = %server_name, error = %e, "Output stream closed");
                    break;
                }
            }
        }
        tail.stream_closed();
    });
}
