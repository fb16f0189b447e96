//! Process-wide cleanup of spawned tool-server processes.
//!
//! This is the last line of defense against orphaned children: every
//! spawned process is recorded in a [`CleanupRegistry`] before its launcher
//! returns, and the registry terminates whatever is still alive when the
//! host shuts down, however it shuts down.
//!
//! # Components
//!
//! * `registry` - The ledger of tracked processes and the escalating `terminate_all`
//! * `hooks` - One-time installation of the signal and exit paths that drive it
//!
//! # Examples
//!
//! ```no_run
//! use mcp_supervisor::cleanup::{CleanupRegistry, install_cleanup_hooks};
//!
//! #[tokio::main]
//! async fn main() -> mcp_supervisor::Result<()> {
//!     let hooks = install_cleanup_hooks(CleanupRegistry::global())?;
//!
//!     // ... start servers ...
//!
//!     hooks.shutdown_requested().await;
//!     Ok(())
//! } // dropping `hooks` runs a final cleanup pass
//! ```
pub mod hooks;
pub mod registry;

pub use hooks::{CleanupHooks, install_cleanup_hooks, termination_requested, wait_for_shutdown_signal};
pub use registry::{CleanupRegistry, TrackedProcess};
