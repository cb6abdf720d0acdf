//! Per-request state handed to tool handlers.

use std::sync::Arc;

use serde_json::Value;

use crate::config::McpConfig;
use crate::index::EntityIndex;
use crate::store::Snapshot;

/// Everything a tool may read: declaration, revision and built index.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Repository content at the served revision.
    pub snapshot: Arc<Snapshot>,
    /// Index of the primary XML source.
    pub index: Arc<EntityIndex>,
    /// Dispatcher runtime statistics, filled in for `identify`.
    pub server_stats: Option<Value>,
}

impl ToolContext {
    pub fn new(snapshot: Arc<Snapshot>, index: Arc<EntityIndex>) -> Self {
        Self {
            snapshot,
            index,
            server_stats: None,
        }
    }

    pub fn config(&self) -> &McpConfig {
        &self.snapshot.config
    }

    pub fn revision(&self) -> &str {
        &self.snapshot.revision
    }

    /// Name reported to clients.
    pub fn server_name(&self) -> &str {
        &self.snapshot.config.server.name
    }
}
