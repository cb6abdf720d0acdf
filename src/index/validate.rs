//! Source validation.
//!
//! [`validate_xml`] only checks that a document is well-formed and
//! collects index statistics. It does not check conformance against the
//! declared XSD schema, even when one is configured.

use std::collections::{BTreeMap, HashMap};

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use super::{build_index, EntityIndex};
use crate::types::IndexStats;

/// Attribute checked for uniqueness across all entities.
const NMR_ATTR: &str = "nmr";

/// Outcome of validating one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub path: String,
    pub valid: bool,
    /// First tokenizer error, if the document is not well-formed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Statistics of a best-effort index build; zero when indexing fails.
    pub stats: IndexStats,
}

/// Checks that `bytes` is well-formed XML and gathers index statistics.
pub fn validate_xml(bytes: &[u8], path: &str) -> ValidationReport {
    let error = check_well_formed(bytes).err();
    let stats = build_index(bytes, path, "")
        .map(|index| index.stats)
        .unwrap_or_default();

    ValidationReport {
        path: path.to_string(),
        valid: error.is_none(),
        error,
        stats,
    }
}

/// Tokenizes the whole document, returning the first error found.
fn check_well_formed(bytes: &[u8]) -> Result<(), String> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut seen_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                e.attributes()
                    .try_for_each(|a| a.map(|_| ()))
                    .map_err(|err| format!("at byte {}: {}", reader.buffer_position(), err))?;
                depth += 1;
                seen_root = true;
            }
            Ok(Event::Empty(e)) => {
                e.attributes()
                    .try_for_each(|a| a.map(|_| ()))
                    .map_err(|err| format!("at byte {}: {}", reader.buffer_position(), err))?;
                seen_root = true;
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Text(e)) => {
                e.unescape()
                    .map_err(|err| format!("at byte {}: {}", reader.buffer_position(), err))?;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("at byte {}: {}", reader.error_position(), e)),
        }
        buf.clear();
    }

    if depth > 0 {
        return Err(format!(
            "at byte {}: unexpected end of document with {} unclosed element(s)",
            reader.buffer_position(),
            depth
        ));
    }
    if !seen_root {
        return Err("document has no root element".to_string());
    }
    Ok(())
}

/// Reports uniqueness violations over a built index.
///
/// Two checks run: no two elements may share an `nmr` attribute value,
/// and no two elements of the same type may share a `code`. Elements
/// displaced by a duplicate id still take part in the nmr check. Messages
/// are ordered deterministically.
pub fn uniqueness_violations(index: &EntityIndex) -> Vec<String> {
    let mut messages = Vec::new();

    let mut nmr_owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for entity in index.all().into_iter().chain(&index.duplicates) {
        if let Some(nmr) = entity.attribute(NMR_ATTR) {
            let nmr = nmr.trim();
            if !nmr.is_empty() {
                nmr_owners.entry(nmr).or_default().push(&entity.id);
            }
        }
    }
    for (nmr, owners) in nmr_owners.iter_mut().filter(|(_, o)| o.len() > 1) {
        owners.sort_unstable();
        messages.push(format!(
            "duplicate nmr '{}' shared by {}",
            nmr,
            owners.join(", ")
        ));
    }

    let mut repeats: HashMap<&str, usize> = HashMap::new();
    for duplicate in &index.duplicates {
        *repeats.entry(duplicate.id.as_str()).or_insert(1) += 1;
    }
    let mut repeats: Vec<(&str, usize)> = repeats.into_iter().collect();
    repeats.sort();
    for (id, count) in repeats {
        let (entity_type, code) = id.split_once(':').unwrap_or((id, ""));
        messages.push(format!(
            "duplicate code '{}' for type '{}' ({} elements share id {})",
            code, entity_type, count, id
        ));
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_document_is_valid() {
        let report = validate_xml(br#"<r><a code="1"/></r>"#, "ok.xml");
        assert!(report.valid);
        assert!(report.error.is_none());
        assert_eq!(report.stats.total_entities, 1);
    }

    #[test]
    fn test_malformed_document_reports_error_and_zero_stats() {
        let report = validate_xml(br#"<r><a code="1"></r>"#, "bad.xml");
        assert!(!report.valid);
        assert!(report.error.is_some());
        assert_eq!(report.stats, IndexStats::default());
    }

    #[test]
    fn test_empty_document_is_not_valid() {
        let report = validate_xml(b"", "empty.xml");
        assert!(!report.valid);
    }

    #[test]
    fn test_nmr_on_displaced_duplicate_is_reported() {
        let xml = br#"<r><org code="1" nmr="A"/><org code="1" nmr="B"/><unit code="9" nmr="B"/></r>"#;
        let index = crate::index::build_index(xml, "r.xml", "").unwrap();
        let messages = uniqueness_violations(&index);
        assert_eq!(
            messages,
            vec![
                "duplicate nmr 'B' shared by org:1, unit:9".to_string(),
                "duplicate code '1' for type 'org' (2 elements share id org:1)".to_string(),
            ]
        );
    }
}
