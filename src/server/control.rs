//! Platform signalling for supervised processes.
//!
//! Every server is spawned as the leader of its own process group, so the
//! group id equals the child's pid. The supervisor and the cleanup registry
//! only ever talk to processes through [`ProcessControl`]; the platform
//! specifics live in the backends below.

use std::io;
use std::sync::Arc;

/// Capability interface for terminating supervised processes.
///
/// Implementations must treat "no such process" as success: terminating an
/// already-dead process is a harmless no-op.
pub trait ProcessControl: Send + Sync {
    /// Ask the whole process group led by `pid` to terminate.
    fn terminate_group(&self, pid: u32) -> io::Result<()>;

    /// Forcefully kill the whole process group led by `pid`.
    fn kill_group(&self, pid: u32) -> io::Result<()>;

    /// Ask the single process `pid` to terminate.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forcefully kill the single process `pid`.
    fn kill(&self, pid: u32) -> io::Result<()>;

    /// Whether a process with this pid still exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether `pid` is alive and still leads its own process group, as every
    /// spawned server does. A recycled pid normally fails this check.
    fn leads_group(&self, pid: u32) -> bool {
        self.is_alive(pid)
    }
}

/// Returns the backend for the current platform.
pub fn platform() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(SignalControl)
    }
    #[cfg(not(unix))]
    {
        Arc::new(TaskKillControl)
    }
}

/// POSIX backend: `killpg`/`kill` through `nix`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalControl;

#[cfg(unix)]
impl SignalControl {
    fn pid(pid: u32) -> io::Result<nix::unistd::Pid> {
        i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .map(nix::unistd::Pid::from_raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {}", pid)))
    }

    fn deliver(result: nix::Result<()>) -> io::Result<()> {
        match result {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[cfg(unix)]
impl ProcessControl for SignalControl {
    fn terminate_group(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{Signal, killpg};
        Self::deliver(killpg(Self::pid(pid)?, Signal::SIGTERM))
    }

    fn kill_group(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{Signal, killpg};
        Self::deliver(killpg(Self::pid(pid)?, Signal::SIGKILL))
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        Self::deliver(kill(Self::pid(pid)?, Signal::SIGTERM))
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        Self::deliver(kill(Self::pid(pid)?, Signal::SIGKILL))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = Self::pid(pid) else {
            return false;
        };
        match nix::sys::signal::kill(pid, None::<nix::sys::signal::Signal>) {
            Ok(()) => true,
            // exists, but belongs to someone else
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn leads_group(&self, pid: u32) -> bool {
        let Ok(pid) = Self::pid(pid) else {
            return false;
        };
        matches!(nix::unistd::getpgid(Some(pid)), Ok(pgid) if pgid == pid)
    }
}

/// Windows backend: `taskkill`, with `/T` for the process tree.
#[cfg(not(unix))]
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskKillControl;

#[cfg(not(unix))]
impl TaskKillControl {
    fn taskkill(pid: u32, tree: bool, force: bool) -> io::Result<()> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string());
        if tree {
            cmd.arg("/T");
        }
        if force {
            cmd.arg("/F");
        }
        let output = cmd.output()?;
        if output.status.success() || !Self::exists(pid) {
            Ok(())
        } else {
            Err(io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    fn exists(pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

#[cfg(not(unix))]
impl ProcessControl for TaskKillControl {
    fn terminate_group(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, true, false)
    }

    fn kill_group(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, true, true)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, false, false)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, false, true)
    }

    fn is_alive(&self, pid: u32) -> bool {
        Self::exists(pid)
    }
}
