//! Configuration module for the MCP supervisor.
//!
//! This module handles parsing, validation, and resolution of the tool-server
//! declarations the supervisor manages. Configuration is YAML (JSON is
//! accepted as well) and is re-read every time the supervisor reloads.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use mcp_supervisor::config::Config;
//!
//! let config = Config::from_file("config/config.yaml").unwrap();
//! println!("Loaded configuration with {} servers", config.mcp_servers.len());
//! ```
//!
//! Resolving definitions programmatically:
//!
//! ```
//! use mcp_supervisor::config::{parse_definitions, Config};
//!
//! let config = Config::parse_from_str(r#"
//! mcp_servers:
//!   toolA:
//!     enabled: true
//!     config:
//!       url: "http://localhost:9001"
//! "#).unwrap();
//!
//! let definitions = parse_definitions(&config);
//! assert_eq!(definitions["toolA"].port, 9001);
//! assert!(!definitions["toolA"].has_script());
//! ```
pub mod definitions;
mod parser;
pub mod validator;

pub use definitions::{DefinitionSource, ServerDefinition, parse_definitions};
pub use parser::{
    ApiConfig, Config, DEFAULT_WORKERS, HealthSettings, MonitorSettings, ServerEntry,
    StartupSettings, SupervisorSettings,
};
pub use validator::validate_config;
