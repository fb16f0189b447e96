use crate::config::parser::{Config, ServerEntry, SupervisorSettings};
use crate::error::{Error, Result};
use crate::config::definitions::{explicit_port, parse_host_port};
use reqwest::Url;
use std::collections::HashMap;

/// Validates a single server entry
pub fn validate_server_entry(name: &str, entry: &ServerEntry) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::ConfigInvalid("Server with empty name".to_string()));
    }

    let url = entry.url();
    if !url.is_empty() {
        let parsed = Url::parse(url).map_err(|e| {
            Error::ConfigInvalid(format!("Server '{}' has invalid url '{}': {}", name, url, e))
        })?;
        if explicit_port(&parsed, url) == Some(0) {
            return Err(Error::ConfigInvalid(format!("Server '{}' uses port 0", name)));
        }
    }

    Ok(())
}

/// Validates supervisor timing settings
pub fn validate_settings(settings: &SupervisorSettings) -> Result<()> {
    if settings.startup.poll_interval_ms == 0 {
        return Err(Error::ConfigInvalid("startup.poll_interval_ms must be positive".to_string()));
    }
    if settings.startup.timeout_ms < settings.startup.poll_interval_ms {
        return Err(Error::ConfigInvalid(
            "startup.timeout_ms must be at least one poll interval".to_string(),
        ));
    }
    if settings.health.timeout_ms == 0 {
        return Err(Error::ConfigInvalid("health.timeout_ms must be positive".to_string()));
    }
    if settings.monitor.interval_secs == 0 {
        return Err(Error::ConfigInvalid("monitor.interval_secs must be positive".to_string()));
    }
    if settings.interpreter.trim().is_empty() {
        return Err(Error::ConfigInvalid("interpreter must not be empty".to_string()));
    }

    Ok(())
}

/// Full configuration validation
///
/// Besides per-entry checks, two enabled servers may not advertise the same
/// host and port: the second would always be adopted as "already running".
pub fn validate_config(config: &Config) -> Result<()> {
    validate_settings(&config.supervisor)?;

    let mut endpoints: HashMap<(String, u16), &str> = HashMap::new();
    let mut names: Vec<&String> = config.mcp_servers.keys().collect();
    names.sort();

    for name in names {
        let entry = &config.mcp_servers[name];
        validate_server_entry(name, entry)?;

        if !entry.enabled {
            continue;
        }
        let endpoint = parse_host_port(entry.url());
        if let Some(other) = endpoints.insert(endpoint.clone(), name) {
            return Err(Error::ConfigInvalid(format!(
                "Servers '{}' and '{}' both use {}:{}",
                other, name, endpoint.0, endpoint.1
            )));
        }
    }

    Ok(())
}
