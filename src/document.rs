//! Document rendering over an entity index.
//!
//! Markdown output groups entities by their top-level types and tabulates
//! the direct children of each group. CSV output is a flat listing with a
//! fixed column set. Rows are sorted by ID so output is deterministic.

use std::collections::BTreeSet;

use crate::errors::{Result, XmlGraphError};
use crate::index::EntityIndex;
use crate::types::Entity;

/// Fixed CSV columns.
pub const CSV_COLUMNS: [&str; 7] = ["type", "id", "name", "parent_id", "code", "nmr", "docPrefix"];

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Markdown,
    Csv,
}

#[allow(clippy::should_implement_trait)]
impl DocumentFormat {
    /// Parses a format name, returning `None` for unsupported values.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(Self::Markdown),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

/// Narrows which entities a document covers.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter<'a> {
    pub entity_type: Option<&'a str>,
    pub parent: Option<&'a str>,
}

/// Renders the index in the requested format.
///
/// A `parent` that is not in the index is an error.
pub fn generate_document(
    index: &EntityIndex,
    title: &str,
    filter: &DocumentFilter<'_>,
    format: DocumentFormat,
) -> Result<String> {
    if let Some(parent) = filter.parent {
        if index.get(parent).is_none() {
            return Err(XmlGraphError::Tool {
                message: format!("entity not found: {}", parent),
            });
        }
    }

    match format {
        DocumentFormat::Markdown => Ok(render_markdown(index, title, filter)),
        DocumentFormat::Csv => render_csv(index, filter),
    }
}

fn sorted_by_id(mut entities: Vec<&Entity>) -> Vec<&Entity> {
    entities.sort_by(|a, b| a.id.cmp(&b.id));
    entities
}

/// Formats an index as Markdown.
pub fn render_markdown(index: &EntityIndex, title: &str, filter: &DocumentFilter<'_>) -> String {
    let mut out = String::new();

    out.push_str(&format!("# {}\n\n", title));
    out.push_str(&format!(
        "_Source: `{}` at revision `{}`, {} entities._\n\n",
        index.source_file, index.commit_sha, index.stats.total_entities
    ));

    if let Some(parent) = filter.parent.and_then(|p| index.get(p)) {
        push_group(&mut out, index, parent, filter.entity_type, "##");
        return out;
    }

    if let Some(entity_type) = filter.entity_type {
        let members = sorted_by_id(index.of_type(entity_type));
        out.push_str(&format!("## {} ({})\n\n", entity_type, members.len()));
        if members.is_empty() {
            out.push_str("_No entities of this type._\n\n");
        }
        for entity in members {
            push_group(&mut out, index, entity, None, "###");
        }
        return out;
    }

    let top_level = index.top_level_types();
    if top_level.is_empty() {
        out.push_str("_No entities._\n");
        return out;
    }
    for entity_type in top_level {
        out.push_str(&format!("## {}\n\n", entity_type));
        let roots = sorted_by_id(
            index
                .of_type(entity_type)
                .into_iter()
                .filter(|e| e.is_root())
                .collect(),
        );
        for entity in roots {
            push_group(&mut out, index, entity, None, "###");
        }
    }

    out
}

/// Writes one entity header followed by a table of its direct children.
fn push_group(
    out: &mut String,
    index: &EntityIndex,
    entity: &Entity,
    child_type: Option<&str>,
    heading: &str,
) {
    out.push_str(&format!("{} {} (`{}`)\n\n", heading, entity.label(), entity.id));

    for (key, value) in entity.attributes.iter().filter(|(k, _)| k.as_str() != "name") {
        out.push_str(&format!("- **{}**: {}\n", key, escape_cell(value)));
    }
    if !entity.attributes.is_empty() {
        out.push('\n');
    }

    let children = sorted_by_id(
        index
            .children_of(&entity.id)
            .into_iter()
            .filter(|c| child_type.is_none_or(|t| c.entity_type == t))
            .collect(),
    );
    if children.is_empty() {
        out.push_str("_No child entities._\n\n");
        return;
    }

    let columns: BTreeSet<&str> = children
        .iter()
        .flat_map(|c| c.attributes.keys().map(String::as_str))
        .filter(|k| *k != "name")
        .collect();

    out.push_str("| ID | Type | Name |");
    for column in &columns {
        out.push_str(&format!(" {} |", column));
    }
    out.push_str("\n|---|---|---|");
    for _ in &columns {
        out.push_str("---|");
    }
    out.push('\n');

    for child in children {
        out.push_str(&format!(
            "| {} | {} | {} |",
            escape_cell(&child.id),
            escape_cell(&child.entity_type),
            escape_cell(&child.name)
        ));
        for column in &columns {
            out.push_str(&format!(
                " {} |",
                escape_cell(child.attribute(column).unwrap_or_default())
            ));
        }
        out.push('\n');
    }
    out.push('\n');
}

fn escape_cell(value: &str) -> String {
    value
        .replace('|', "\\|")
        .replace(['\r', '\n'], " ")
}

/// Selects the rows of a CSV export.
fn csv_rows<'a>(index: &'a EntityIndex, filter: &DocumentFilter<'_>) -> Vec<&'a Entity> {
    let scope = match filter.parent {
        Some(parent) => index.subtree(parent),
        None => index.all(),
    };
    sorted_by_id(
        scope
            .into_iter()
            .filter(|e| filter.entity_type.is_none_or(|t| e.entity_type == t))
            .collect(),
    )
}

/// Formats an index as CSV with a header row and one row per entity.
pub fn render_csv(index: &EntityIndex, filter: &DocumentFilter<'_>) -> Result<String> {
    let mut wtr = csv::WriterBuilder::new().from_writer(Vec::new());
    wtr.write_record(CSV_COLUMNS)?;

    for entity in csv_rows(index, filter) {
        wtr.write_record([
            entity.entity_type.as_str(),
            entity.id.as_str(),
            entity.name.as_str(),
            entity.parent_id.as_str(),
            entity.code(),
            entity.attribute("nmr").unwrap_or_default(),
            entity.attribute("docPrefix").unwrap_or_default(),
        ])?;
    }

    let bytes = wtr.into_inner().map_err(|e| XmlGraphError::Tool {
        message: format!("failed to flush CSV writer: {}", e),
    })?;
    String::from_utf8(bytes).map_err(|e| XmlGraphError::Tool {
        message: format!("CSV output is not UTF-8: {}", e),
    })
}
