//! MCP tool definitions, handlers and the read-only tool registry.
//!
//! Every tool is a pure function of a [`ToolContext`] and its JSON
//! arguments. Bad arguments, unknown tools and missing entities produce a
//! normal result flagged with `isError`; only a handler `Err` escapes as a
//! protocol error.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::context::ToolContext;
use super::server::MCP_PROTOCOL_VERSION;
use crate::document::{generate_document, DocumentFilter, DocumentFormat};
use crate::errors::Result;
use crate::index::{uniqueness_violations, validate_xml};
use crate::types::{Entity, EntitySummary};

/// Maximum character length for a tool response before truncation.
const MAX_RESPONSE_CHARS: usize = 100_000;

const DEFAULT_SEARCH_LIMIT: u64 = 25;
const MAX_SEARCH_LIMIT: u64 = 100;

/// Number of suggestions offered when `get_entity` misses.
const SUGGESTION_COUNT: usize = 3;

/// A tool definition exposed by the MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// Result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// A successful text result, truncated to the response limit.
    pub fn text(text: impl AsRef<str>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: truncate_response(text.as_ref()),
            }],
            is_error: false,
        }
    }

    /// A successful result holding pretty-printed JSON.
    pub fn json(value: &Value) -> Self {
        Self::text(serde_json::to_string_pretty(value).unwrap_or_default())
    }

    /// A tool-level failure the caller can fix by changing arguments.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// Concatenated text of all content blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Signature shared by all tool handlers.
pub type ToolHandler = fn(&ToolContext, &Value) -> Result<ToolCallResult>;

/// Immutable name-to-handler table, built once at startup.
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    handlers: HashMap<&'static str, ToolHandler>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let handlers: [(&'static str, ToolHandler); 8] = [
            ("help", handle_help),
            ("identify", handle_identify),
            ("describe_model", handle_describe_model),
            ("search", handle_search),
            ("get_entity", handle_get_entity),
            ("list_entities", handle_list_entities),
            ("validate", handle_validate),
            ("generate_document", handle_generate_document),
        ];

        Self {
            definitions: get_tool_definitions(),
            handlers: handlers.into_iter().collect(),
        }
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Runs a tool. Unknown names yield an `isError` result.
    pub fn call(&self, ctx: &ToolContext, name: &str, args: &Value) -> Result<ToolCallResult> {
        match self.handlers.get(name) {
            Some(handler) => handler(ctx, args),
            None => Ok(ToolCallResult::error(format!(
                "Unknown tool: {}. Call tools/list for the available tools.",
                name
            ))),
        }
    }
}

/// Returns the list of all tool definitions exposed by this MCP server.
pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "help".to_string(),
            description: "Describe this server, its tools and its declared data sources.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolDefinition {
            name: "identify".to_string(),
            description: "Return server name, version, protocol, transports, revision and declared sources.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolDefinition {
            name: "describe_model".to_string(),
            description: "Summarize the entity model: per type, its count, attribute keys and sampled parent/child types.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolDefinition {
            name: "search".to_string(),
            description: "Case-insensitive search across entity names, IDs and attribute values.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Text to look for"
                    },
                    "limit": {
                        "type": "number",
                        "description": "Maximum number of results (default: 25, max: 100)"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "get_entity".to_string(),
            description: "Retrieve one entity by its ID (`<type>:<code>`), with attributes, parent and children.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {
                        "type": "string",
                        "description": "Entity ID, e.g. organization:100"
                    }
                },
                "required": ["id"]
            }),
        },
        ToolDefinition {
            name: "list_entities".to_string(),
            description: "List entities: children of a parent, all entities of a type, or everything.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "description": "Entity type to list"
                    },
                    "parent": {
                        "type": "string",
                        "description": "ID of the entity whose direct children to list"
                    }
                }
            }),
        },
        ToolDefinition {
            name: "validate".to_string(),
            description: "Check that declared XML sources are well-formed and that nmr values and per-type codes are unique. Does not check XSD conformance.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolDefinition {
            name: "generate_document".to_string(),
            description: "Render the entity hierarchy as Markdown tables or as flat CSV.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "description": "Only cover entities of this type"
                    },
                    "parent": {
                        "type": "string",
                        "description": "Only cover this entity and what it contains"
                    },
                    "format": {
                        "type": "string",
                        "enum": ["markdown", "csv"],
                        "description": "Output format (default: markdown)"
                    }
                }
            }),
        },
    ]
}

/// Truncates a string to the maximum response character limit, appending
/// a truncation notice if necessary.
fn truncate_response(s: &str) -> String {
    if s.len() <= MAX_RESPONSE_CHARS {
        s.to_string()
    } else {
        // Find a valid UTF-8 character boundary at or before MAX_RESPONSE_CHARS
        let mut end = MAX_RESPONSE_CHARS;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}\n\n[... truncated at {} chars]", &s[..end], end)
    }
}

/// Reads a required, non-blank string argument.
fn required_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(Value::String(_)) => Err(format!("parameter '{}' must not be empty", key)),
        Some(Value::Null) | None => Err(format!("missing required parameter: {}", key)),
        Some(_) => Err(format!("parameter '{}' must be a string", key)),
    }
}

/// Reads an optional string argument; blank strings count as absent.
fn optional_str<'a>(args: &'a Value, key: &str) -> std::result::Result<Option<&'a str>, String> {
    match args.get(key) {
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(format!("parameter '{}' must be a string", key)),
    }
}

fn summaries<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Vec<EntitySummary> {
    entities.into_iter().map(EntitySummary::from).collect()
}

fn sources_json(ctx: &ToolContext) -> Value {
    serde_json::to_value(&ctx.config().sources).unwrap_or_else(|_| json!([]))
}

/// Handles `help` tool calls.
fn handle_help(ctx: &ToolContext, _args: &Value) -> Result<ToolCallResult> {
    let config = ctx.config();
    let mut out = String::new();

    out.push_str(&format!(
        "{} is a read-only MCP server over an XML entity registry.\n",
        ctx.server_name()
    ));
    if !config.server.description.is_empty() {
        out.push_str(&format!("{}\n", config.server.description));
    }
    out.push_str(
        "\nEvery element carrying a `code` attribute is an entity with ID `<type>:<code>`; \
         entities nest the way their elements do.\n\nTools:\n",
    );
    for tool in get_tool_definitions() {
        out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }

    out.push_str("\nSources:\n");
    for source in &config.sources {
        let kind = if source.source_type.is_empty() {
            "unspecified"
        } else {
            source.source_type.as_str()
        };
        out.push_str(&format!("- {} ({})", source.path, kind));
        if let Some(description) = &source.description {
            out.push_str(&format!(": {}", description));
        }
        out.push('\n');
    }

    if !config.server.instructions.is_empty() {
        out.push_str(&format!("\n{}\n", config.server.instructions));
    }

    Ok(ToolCallResult::text(out))
}

/// Handles `identify` tool calls.
fn handle_identify(ctx: &ToolContext, _args: &Value) -> Result<ToolCallResult> {
    let mut output = json!({
        "server": {
            "name": ctx.server_name(),
            "description": ctx.config().server.description,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "protocol_version": MCP_PROTOCOL_VERSION,
        "config_version": ctx.config().version,
        "transports": ["http", "sse", "stdio"],
        "repository": ctx.snapshot.repo,
        "revision": ctx.revision(),
        "sources": sources_json(ctx),
        "index": {
            "source_file": ctx.index.source_file,
            "total_entities": ctx.index.stats.total_entities,
        },
    });
    if let Some(stats) = &ctx.server_stats {
        output["stats"] = stats.clone();
    }
    Ok(ToolCallResult::json(&output))
}

/// Handles `describe_model` tool calls.
///
/// `parent_type` and `child_type` come from the first entity of each type
/// that has a parent or a child. They are a sample, not inferred schema.
fn handle_describe_model(ctx: &ToolContext, _args: &Value) -> Result<ToolCallResult> {
    let index = &ctx.index;

    let types: Vec<Value> = index
        .by_type
        .keys()
        .map(|entity_type| {
            let members = index.of_type(entity_type);
            let attributes: BTreeSet<&str> = members
                .iter()
                .flat_map(|e| e.attributes.keys().map(String::as_str))
                .collect();
            let parent_type = members
                .iter()
                .find(|e| !e.is_root())
                .and_then(|e| index.get(&e.parent_id))
                .map(|p| p.entity_type.clone());
            let child_type = members
                .iter()
                .find_map(|e| e.children.first())
                .and_then(|id| index.get(id))
                .map(|c| c.entity_type.clone());

            json!({
                "type": entity_type,
                "count": members.len(),
                "attributes": attributes,
                "parent_type": parent_type,
                "child_type": child_type,
            })
        })
        .collect();

    Ok(ToolCallResult::json(&json!({
        "source_file": index.source_file,
        "total_entities": index.stats.total_entities,
        "types": types,
        "note": "parent_type and child_type are sampled from the first entity of each type that has one; they are not a full schema.",
    })))
}

/// Handles `search` tool calls.
fn handle_search(ctx: &ToolContext, args: &Value) -> Result<ToolCallResult> {
    let query = match required_str(args, "query") {
        Ok(q) => q,
        Err(message) => return Ok(ToolCallResult::error(message)),
    };

    let limit = match args.get("limit") {
        None | Some(Value::Null) => DEFAULT_SEARCH_LIMIT,
        Some(v) => match v.as_f64() {
            Some(n) => (n.max(1.0) as u64).min(MAX_SEARCH_LIMIT),
            None => return Ok(ToolCallResult::error("parameter 'limit' must be a number")),
        },
    };

    let results = ctx.index.search_entities(query, limit as usize);

    Ok(ToolCallResult::json(&json!({
        "query": query,
        "limit": limit,
        "count": results.len(),
        "results": summaries(results),
    })))
}

/// Handles `get_entity` tool calls.
fn handle_get_entity(ctx: &ToolContext, args: &Value) -> Result<ToolCallResult> {
    let id = match required_str(args, "id") {
        Ok(id) => id,
        Err(message) => return Ok(ToolCallResult::error(message)),
    };
    let index = &ctx.index;

    let Some(entity) = index.get(id) else {
        let mut suggestions = index.search_entities(id, SUGGESTION_COUNT);
        if suggestions.is_empty() {
            if let Some((_, code)) = id.split_once(':') {
                if !code.is_empty() {
                    suggestions = index.search_entities(code, SUGGESTION_COUNT);
                }
            }
        }

        let mut message = format!("Entity not found: {}", id);
        if !suggestions.is_empty() {
            message.push_str("\nDid you mean:");
            for s in suggestions {
                message.push_str(&format!("\n- {} ({})", s.id, s.label()));
            }
        }
        return Ok(ToolCallResult::error(message));
    };

    let parent_name = index.get(&entity.parent_id).map(|p| p.name.clone());
    let children = summaries(index.children_of(&entity.id));

    Ok(ToolCallResult::json(&json!({
        "id": entity.id,
        "type": entity.entity_type,
        "name": entity.name,
        "parent_id": entity.parent_id,
        "parent_name": parent_name,
        "attributes": entity.attributes,
        "child_count": children.len(),
        "children": children,
    })))
}

/// Handles `list_entities` tool calls.
fn handle_list_entities(ctx: &ToolContext, args: &Value) -> Result<ToolCallResult> {
    let (entity_type, parent) = match (optional_str(args, "type"), optional_str(args, "parent")) {
        (Ok(t), Ok(p)) => (t, p),
        (Err(message), _) | (_, Err(message)) => return Ok(ToolCallResult::error(message)),
    };
    let index = &ctx.index;

    if let Some(parent) = parent {
        if index.get(parent).is_none() {
            return Ok(ToolCallResult::error(format!("Entity not found: {}", parent)));
        }
        let children: Vec<&Entity> = index
            .children_of(parent)
            .into_iter()
            .filter(|c| entity_type.is_none_or(|t| c.entity_type == t))
            .collect();
        return Ok(ToolCallResult::json(&json!({
            "mode": "parent",
            "parent": parent,
            "type": entity_type,
            "count": children.len(),
            "entities": summaries(children),
        })));
    }

    if let Some(entity_type) = entity_type {
        if !index.by_type.contains_key(entity_type) {
            return Ok(ToolCallResult::json(&json!({
                "mode": "type",
                "type": entity_type,
                "count": 0,
                "entities": [],
                "message": format!("Unknown entity type '{}'.", entity_type),
                "valid_types": index.types(),
            })));
        }
        let members = index.of_type(entity_type);
        return Ok(ToolCallResult::json(&json!({
            "mode": "type",
            "type": entity_type,
            "count": members.len(),
            "entities": summaries(members),
        })));
    }

    let all = index.all();
    Ok(ToolCallResult::json(&json!({
        "mode": "all",
        "count": all.len(),
        "entities": summaries(all),
    })))
}

/// Handles `validate` tool calls.
///
/// Violations are reported, never raised. Only an unreadable source file
/// makes the call fail.
fn handle_validate(ctx: &ToolContext, _args: &Value) -> Result<ToolCallResult> {
    let mut reports = Vec::new();
    let mut messages = Vec::new();

    for source in ctx.config().sources.iter().filter(|s| s.is_xml()) {
        let bytes = ctx.snapshot.read_file(&source.path)?;
        let report = validate_xml(&bytes, &source.path);
        if let Some(error) = &report.error {
            messages.push(format!("{}: {}", source.path, error));
        }
        reports.push(report);
    }

    messages.extend(uniqueness_violations(&ctx.index));
    let valid = messages.is_empty();

    Ok(ToolCallResult::json(&json!({
        "valid": valid,
        "revision": ctx.revision(),
        "sources": reports,
        "messages": messages,
        "note": "Checks well-formedness and uniqueness only; XSD schema conformance is not verified.",
    })))
}

/// Handles `generate_document` tool calls.
fn handle_generate_document(ctx: &ToolContext, args: &Value) -> Result<ToolCallResult> {
    let parsed = (
        optional_str(args, "type"),
        optional_str(args, "parent"),
        optional_str(args, "format"),
    );
    let (entity_type, parent, format) = match parsed {
        (Ok(t), Ok(p), Ok(f)) => (t, p, f),
        (Err(message), _, _) | (_, Err(message), _) | (_, _, Err(message)) => {
            return Ok(ToolCallResult::error(message))
        }
    };

    let format = match format {
        None => DocumentFormat::Markdown,
        Some(name) => match DocumentFormat::from_str(name) {
            Some(f) => f,
            None => {
                return Ok(ToolCallResult::error(format!(
                    "Unsupported format '{}'. Use 'markdown' or 'csv'.",
                    name
                )))
            }
        },
    };

    if let Some(parent) = parent {
        if ctx.index.get(parent).is_none() {
            return Ok(ToolCallResult::error(format!("Entity not found: {}", parent)));
        }
    }

    let filter = DocumentFilter {
        entity_type,
        parent,
    };
    let document = generate_document(&ctx.index, ctx.server_name(), &filter, format)?;
    Ok(ToolCallResult::text(document))
}
