use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, XmlGraphError};

/// Name of the source declaration file at the root of each repository.
pub const MCP_CONFIG_FILENAME: &str = "mcp.yaml";

/// Name of the optional server settings file in the repositories root.
pub const SETTINGS_FILENAME: &str = "xmlgraph.toml";

/// Default protocol version marker written in `mcp.yaml`.
pub const DEFAULT_CONFIG_VERSION: &str = "1.0";

/// Parsed source declaration of one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    /// Protocol version marker of the declaration format.
    #[serde(default = "default_version")]
    pub version: String,
    /// Server metadata reported to clients.
    #[serde(default)]
    pub server: ServerMeta,
    /// Declared sources, in declaration order.
    #[serde(default)]
    pub sources: Vec<SourceDecl>,
}

fn default_version() -> String {
    DEFAULT_CONFIG_VERSION.to_string()
}

/// Server metadata block of the source declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
}

/// One declared data source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDecl {
    /// Path of the file, relative to the repository root.
    pub path: String,
    /// Declared kind of the source, e.g. `xml`.
    #[serde(default, rename = "type")]
    pub source_type: String,
    /// Optional schema file path. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SourceDecl {
    /// Returns `true` if this source should be treated as XML.
    ///
    /// An explicit `type` wins; without one the file extension decides.
    pub fn is_xml(&self) -> bool {
        if self.source_type.is_empty() {
            self.path.to_ascii_lowercase().ends_with(".xml")
        } else {
            self.source_type.eq_ignore_ascii_case("xml")
        }
    }
}

impl McpConfig {
    /// Returns the first declared XML source, which backs the tool index.
    pub fn primary_source(&self) -> Option<&SourceDecl> {
        self.sources.iter().find(|s| s.is_xml())
    }
}

/// Parses a source declaration from YAML bytes.
///
/// `fallback_name` is used as the server name when the declaration leaves
/// it empty.
pub fn load_mcp_config(bytes: &[u8], fallback_name: &str) -> Result<McpConfig> {
    let mut config: McpConfig = serde_yaml::from_slice(bytes)?;

    if config.sources.is_empty() {
        return Err(XmlGraphError::Config {
            message: "source declaration lists no sources".to_string(),
        });
    }
    if let Some(pos) = config.sources.iter().position(|s| s.path.trim().is_empty()) {
        return Err(XmlGraphError::Config {
            message: format!("source #{} has an empty path", pos + 1),
        });
    }
    if config.server.name.trim().is_empty() {
        config.server.name = fallback_name.to_string();
    }

    Ok(config)
}

/// Runtime settings of the HTTP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to listen on.
    pub bind: String,
    /// Maximum number of concurrently registered SSE sessions.
    pub max_sessions: usize,
    /// Capacity of each session's inbound request queue.
    pub session_queue_capacity: usize,
    /// Interval between SSE keep-alive comments, in seconds.
    pub keepalive_secs: u64,
    /// Maximum accepted JSON-RPC request body size in bytes.
    pub max_body_bytes: usize,
    /// Maximum number of built indexes kept in memory.
    pub index_cache_entries: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            max_sessions: 100,
            session_queue_capacity: 16,
            keepalive_secs: 15,
            max_body_bytes: 1_048_576,
            index_cache_entries: 32,
        }
    }
}

/// Loads server settings from `xmlgraph.toml` inside `root`.
///
/// If the file does not exist, returns the default settings.
pub fn load_settings(root: &Path) -> Result<ServerSettings> {
    let path = root.join(SETTINGS_FILENAME);

    if !path.exists() {
        return Ok(ServerSettings::default());
    }

    let contents = fs::read_to_string(&path).map_err(|e| XmlGraphError::Config {
        message: format!("failed to read settings file '{}': {}", path.display(), e),
    })?;

    toml::from_str(&contents).map_err(|e| XmlGraphError::Config {
        message: format!("failed to parse settings file '{}': {}", path.display(), e),
    })
}
