use super::EntityIndex;
use crate::types::Entity;

impl EntityIndex {
    /// Finds entities whose name, ID or any attribute value contains
    /// `query`, ignoring case.
    ///
    /// Results are ordered by ID and capped at `limit`. A query without
    /// matches yields an empty vector.
    pub fn search_entities(&self, query: &str, limit: usize) -> Vec<&Entity> {
        let needle = query.to_lowercase();

        self.sorted_ids
            .iter()
            .filter_map(|id| self.entities.get(id))
            .filter(|entity| matches_entity(entity, &needle))
            .take(limit)
            .collect()
    }
}

fn matches_entity(entity: &Entity, needle: &str) -> bool {
    contains_ignore_case(&entity.name, needle)
        || contains_ignore_case(&entity.id, needle)
        || entity
            .attributes
            .values()
            .any(|value| contains_ignore_case(value, needle))
}

fn contains_ignore_case(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}
