use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of Actix Web workers for the status API.
pub const DEFAULT_WORKERS: usize = 2;

/// Declaration of a single tool server as written in the configuration file.
///
/// Everything under `config` is kept verbatim: `url` advertises where the
/// server listens, every other scalar key is forwarded into the process
/// environment when the server is launched.
///
/// # Examples
///
/// ```
/// use mcp_supervisor::config::ServerEntry;
///
/// let entry: ServerEntry = serde_yaml::from_str(r#"
/// enabled: true
/// description: "Elasticsearch bridge"
/// config:
///   url: "http://localhost:8082/sse"
///   es_url: "https://es.internal:9200"
/// "#).unwrap();
///
/// assert!(entry.enabled);
/// assert_eq!(entry.url(), "http://localhost:8082/sse");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Whether the supervisor should manage this server.
    #[serde(default)]
    pub enabled: bool,

    /// Human readable description.
    #[serde(default)]
    pub description: String,

    /// Free-form server settings, including the advertised `url`.
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,
}

impl ServerEntry {
    /// The advertised URL, or an empty string when none is configured.
    pub fn url(&self) -> &str {
        self.config
            .get("url")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or("")
    }
}

/// Startup polling bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Total time to wait for a freshly spawned server to answer its probe.
    pub timeout_ms: u64,
    /// Delay between two startup probes.
    pub poll_interval_ms: u64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            poll_interval_ms: 500,
        }
    }
}

impl StartupSettings {
    /// Startup bound as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Health probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Path requested on every probe.
    pub path: String,
    /// Hard bound for a single probe.
    pub timeout_ms: u64,
    /// HTTP statuses that count as "the process answered".
    pub alive_statuses: Vec<u16>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            path: "/sse".to_string(),
            timeout_ms: 2_000,
            // 500 is what an SSE endpoint answers to a request without a handshake
            alive_statuses: vec![200, 500],
        }
    }
}

impl HealthSettings {
    /// Probe timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Background health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Whether `start_health_monitor` spawns the loop at all.
    pub enabled: bool,
    /// Seconds between two health cycles.
    pub interval_secs: u64,
    /// How long `stop` waits for an in-flight cycle before aborting it.
    pub shutdown_grace_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            shutdown_grace_ms: 3_000,
        }
    }
}

/// Supervisor-wide settings.
///
/// Every field has a default, so the whole `supervisor` block is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Directory that launch scripts are resolved against and that becomes
    /// the working directory and search path of every launched server.
    pub project_root: PathBuf,
    /// Program used to run launch scripts.
    pub interpreter: String,
    /// Environment variable that receives the project root as a search path.
    pub search_path_var: String,
    /// Additional or overriding name → script entries.
    pub scripts: HashMap<String, PathBuf>,
    /// Startup polling bounds.
    pub startup: StartupSettings,
    /// Grace period between graceful termination and force kill in `stop`.
    pub stop_grace_ms: u64,
    /// Health probe settings.
    pub health: HealthSettings,
    /// Background monitor settings.
    pub monitor: MonitorSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            interpreter: "python3".to_string(),
            search_path_var: "PYTHONPATH".to_string(),
            scripts: HashMap::new(),
            startup: StartupSettings::default(),
            stop_grace_ms: 5_000,
            health: HealthSettings::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

impl SupervisorSettings {
    /// Stop grace period as a `Duration`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Configuration for the optional status HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind.
    #[serde(default = "default_api_address")]
    pub address: String,
    /// Port to bind.
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Number of Actix Web workers.
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_api_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: default_api_address(),
            port: default_api_port(),
            workers: None,
        }
    }
}

/// Main configuration for the supervisor.
///
/// # YAML layout
///
/// ```yaml
/// mcp_servers:
///   elasticsearch:
///     enabled: true
///     description: "Elasticsearch bridge"
///     config:
///       url: "http://localhost:8082/sse"
///       es_url: "https://es.internal:9200"
/// supervisor:
///   project_root: "/opt/copilot"
///   interpreter: "python3"
/// api:
///   port: 8000
/// ```
///
/// Entries under `mcp_servers` that are not mappings are skipped with a
/// warning instead of failing the whole file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    /// Server name → declaration.
    pub mcp_servers: HashMap<String, ServerEntry>,
    /// Supervisor-wide settings.
    pub supervisor: SupervisorSettings,
    /// Status HTTP surface, if it should be served.
    pub api: Option<ApiConfig>,
}

#[derive(Deserialize)]
struct RawConfig {
    // `mcp_servers:` with nothing under it parses as null
    #[serde(default)]
    mcp_servers: Option<HashMap<String, serde_yaml::Value>>,
    #[serde(default)]
    supervisor: SupervisorSettings,
    #[serde(default)]
    api: Option<ApiConfig>,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// The file may be YAML or JSON (JSON documents parse as YAML).
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigParse` if the file cannot be read or its
    /// contents do not match the expected layout.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        Self::parse_from_str(&content)
    }

    /// Parses a configuration from a YAML or JSON string.
    ///
    /// An empty document yields an empty configuration.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: RawConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse config: {}", e)))?;

        let entries = raw.mcp_servers.unwrap_or_default();
        let mut mcp_servers = HashMap::with_capacity(entries.len());
        for (name, value) in entries {
            if !value.is_mapping() {
                tracing::warn!(server_name = %name, "Skipping server entry that is not a mapping");
                continue;
            }
            match serde_yaml::from_value::<ServerEntry>(value) {
                Ok(entry) => {
                    mcp_servers.insert(name, entry);
                }
                Err(e) => {
                    tracing::warn!(server_name = %name, error = %e, "Skipping malformed server entry");
                }
            }
        }

        Ok(Self {
            mcp_servers,
            supervisor: raw.supervisor,
            api: raw.api,
        })
    }
}
