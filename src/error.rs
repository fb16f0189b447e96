/// Error handling module for the MCP supervisor.
///
/// This module defines the error types used throughout the library.
/// None of these errors is fatal to the host process: a tool server that
/// cannot be started degrades the copilot's capabilities, not its
/// availability.
///
/// # Example
///
/// ```
/// use mcp_supervisor::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::ServerNotFound(name)) => println!("Server '{}' is not defined", name),
///         Err(Error::ScriptMissing(name)) => println!("No launch script for '{}'", name),
///         Err(Error::Process(msg)) => println!("Server process failed: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use crate::server::ServerStatus;
use thiserror::Error;

/// Errors that can occur in the mcp-supervisor library.
///
/// Each variant includes enough context to tell an operator which server
/// misbehaved and why.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to read or parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration file cannot be read
    /// - The YAML/JSON is malformed
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parses but contains invalid values.
    ///
    /// This error occurs when:
    /// - A server URL cannot be parsed
    /// - Two enabled servers claim the same host and port
    /// - Timing settings are zero or inconsistent
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The requested server is not present in the current definitions.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// A start was requested for a server that is disabled in configuration.
    #[error("Server disabled: {0}")]
    ServerDisabled(String),

    /// The server has no resolvable launch script.
    ///
    /// This error occurs when:
    /// - The server name has no entry in the script table
    /// - The script file does not exist on disk
    #[error("Launch script missing for server: {0}")]
    ScriptMissing(String),

    /// The operating system refused to spawn the server process.
    ///
    /// This error occurs when:
    /// - The interpreter is not installed
    /// - The script or interpreter is not executable
    #[error("Failed to launch server process: {0}")]
    Launch(String),

    /// Another start for the same server is still in progress.
    #[error("Start already in progress: {0}")]
    AlreadyStarting(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("Invalid state transition for '{name}': {from} -> {to}")]
    InvalidTransition {
        /// Server name
        name: String,
        /// Status before the attempted transition
        from: ServerStatus,
        /// Requested status
        to: ServerStatus,
    },

    /// The server process misbehaved after it was spawned.
    ///
    /// This error occurs when:
    /// - The process exits before answering its health probe
    /// - Signalling or reaping the process fails
    #[error("Server process error: {0}")]
    Process(String),

    /// An operation did not complete within its bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The host received a termination signal; no new processes are started.
    #[error("Host is shutting down")]
    ShuttingDown,

    /// Process-wide cleanup hooks were already installed.
    #[error("Cleanup hooks are already installed")]
    HooksAlreadyInstalled,

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for mcp-supervisor operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module.
pub type Result<T> = std::result::Result<T, Error>;
