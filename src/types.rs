use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A `code`-bearing XML element promoted to an addressable node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier in the form `<type>:<code>`.
    pub id: String,
    /// Local name of the XML element, namespace prefix stripped.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Best-effort human label; empty when no name source exists.
    pub name: String,
    /// ID of the nearest enclosing entity, empty for root-level entities.
    pub parent_id: String,
    /// XML attributes plus text of non-entity child elements.
    ///
    /// Repeated child tags are joined with `", "` in document order.
    pub attributes: BTreeMap<String, String>,
    /// IDs of direct child entities in document order.
    pub children: Vec<String>,
}

impl Entity {
    /// Returns the `code` attribute this entity was detected by.
    pub fn code(&self) -> &str {
        self.attribute("code").unwrap_or_default()
    }

    /// Looks up an attribute value by key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Returns `true` if this entity has no enclosing entity.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }

    /// Returns the name, falling back to the ID when the name is empty.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Compact view of an entity used in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub parent_id: String,
}

impl From<&Entity> for EntitySummary {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            entity_type: entity.entity_type.clone(),
            name: entity.name.clone(),
            parent_id: entity.parent_id.clone(),
        }
    }
}

/// Aggregate statistics about an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of distinct entities in the index.
    pub total_entities: usize,
    /// Entity count per entity type.
    pub type_counts: BTreeMap<String, usize>,
}
