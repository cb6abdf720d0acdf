//! In-memory entity graph built from one XML source at one revision.
//!
//! The index is immutable once [`build_index`] returns and is shared across
//! concurrent requests behind an `Arc` without further locking.

/// Streaming XML-to-entity indexer.
pub mod indexer;

/// Case-insensitive full-text search over entities.
pub mod search;

/// Well-formedness checks and uniqueness reports.
pub mod validate;

use std::collections::{BTreeMap, HashMap};

use crate::types::{Entity, IndexStats};

pub use indexer::build_index;
pub use validate::{uniqueness_violations, validate_xml, ValidationReport};

/// Entity graph and lookup tables for one source file.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    /// All entities keyed by ID.
    pub entities: HashMap<String, Entity>,
    /// Entity IDs per type, in document order.
    pub by_type: BTreeMap<String, Vec<String>>,
    /// Direct child entity IDs per parent ID, in document order.
    pub by_parent: HashMap<String, Vec<String>>,
    /// Later elements whose ID was already taken by an earlier element.
    pub duplicates: Vec<Entity>,
    /// Path of the indexed file.
    pub source_file: String,
    /// Revision the file was read at.
    pub commit_sha: String,
    pub stats: IndexStats,
    /// All entity IDs sorted ascending.
    pub(crate) sorted_ids: Vec<String>,
}

impl EntityIndex {
    /// Looks up an entity by exact ID.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Returns the number of distinct entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Returns the known entity types in ascending order.
    pub fn types(&self) -> Vec<&str> {
        self.by_type.keys().map(String::as_str).collect()
    }

    /// Returns all entities sorted by ID.
    pub fn all(&self) -> Vec<&Entity> {
        self.sorted_ids
            .iter()
            .filter_map(|id| self.entities.get(id))
            .collect()
    }

    /// Returns the entities of one type in document order.
    pub fn of_type(&self, entity_type: &str) -> Vec<&Entity> {
        self.by_type
            .get(entity_type)
            .map(|ids| ids.iter().filter_map(|id| self.entities.get(id)).collect())
            .unwrap_or_default()
    }

    /// Returns the direct children of an entity in document order.
    pub fn children_of(&self, parent_id: &str) -> Vec<&Entity> {
        self.by_parent
            .get(parent_id)
            .map(|ids| ids.iter().filter_map(|id| self.entities.get(id)).collect())
            .unwrap_or_default()
    }

    /// Returns the entity and all of its descendants, depth-first.
    pub fn subtree(&self, root_id: &str) -> Vec<&Entity> {
        let mut out = Vec::new();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            out.push(entity);
            if let Some(children) = self.by_parent.get(id) {
                stack.extend(children.iter().rev().map(String::as_str));
            }
        }
        out
    }

    /// Returns the types that have at least one parentless member.
    pub fn top_level_types(&self) -> Vec<&str> {
        self.by_type
            .iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| self.entities.get(id))
                    .any(Entity::is_root)
            })
            .map(|(t, _)| t.as_str())
            .collect()
    }
}
