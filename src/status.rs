//! Operator-facing status snapshots.

use crate::config::ServerDefinition;
use crate::config::definitions::{DEFAULT_PORT, parse_host_port};
use crate::server::{ServerRuntimeState, ServerStatus};
use serde::Serialize;

/// Status of one server as reported to operators.
///
/// Serializes with a lowercase `status` and `error: null` when there is no
/// recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatusReport {
    /// Whether the server is enabled in the current definitions
    pub enabled: bool,
    /// Current lifecycle status
    pub status: ServerStatus,
    /// Port the server is expected on
    pub port: u16,
    /// Advertised URL
    pub url: String,
    /// Most recent failure, if any
    pub error: Option<String>,
    /// Whether a launch script was resolved
    pub has_script: bool,
}

impl ServerStatusReport {
    /// Report for a defined server, with its runtime state if it has one.
    pub fn new(definition: &ServerDefinition, state: Option<&ServerRuntimeState>) -> Self {
        Self {
            enabled: definition.enabled,
            status: state.map_or(ServerStatus::Stopped, |s| s.status),
            port: definition.port,
            url: definition.url.clone(),
            error: state.and_then(|s| s.last_error.clone()),
            has_script: definition.has_script(),
        }
    }

    /// Report for a server that only survives as runtime state, after a
    /// reload removed its definition.
    pub fn orphaned(state: &ServerRuntimeState) -> Self {
        match &state.definition {
            Some(definition) => Self {
                enabled: false,
                ..Self::new(definition, Some(state))
            },
            None => Self {
                enabled: false,
                status: state.status,
                port: DEFAULT_PORT,
                url: String::new(),
                error: state.last_error.clone(),
                has_script: false,
            },
        }
    }

    /// `host:port` view of the report's URL.
    pub fn address(&self) -> String {
        let (host, _) = parse_host_port(&self.url);
        format!("{}:{}", host, self.port)
    }
}
