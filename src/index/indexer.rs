use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Instant;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use super::EntityIndex;
use crate::errors::{Result, XmlGraphError};
use crate::types::{Entity, IndexStats};

/// Attribute whose presence turns an element into an entity.
const CODE_ATTR: &str = "code";

/// Attribute that names an entity explicitly.
const NAME_ATTR: &str = "name";

/// Child element tags that name their enclosing entity.
const NAME_TAGS: [&str; 2] = ["n", "name"];

/// Where a registered entity lives inside the index being built.
#[derive(Debug, Clone)]
enum Slot {
    Primary(String),
    Duplicate(usize),
}

#[derive(Debug)]
enum Frame {
    Entity {
        slot: Slot,
        parent_id: String,
        attr_name: String,
        child_name: Option<String>,
    },
    Plain {
        tag: String,
        direct_child_of_entity: bool,
        text: String,
    },
}

/// Single-pass builder driven by the tokenizer.
struct IndexBuilder {
    index: EntityIndex,
    stack: Vec<Frame>,
    current_parent: String,
}

impl IndexBuilder {
    fn new(source_file: &str, commit_sha: &str) -> Self {
        Self {
            index: EntityIndex {
                source_file: source_file.to_string(),
                commit_sha: commit_sha.to_string(),
                ..EntityIndex::default()
            },
            stack: Vec::new(),
            current_parent: String::new(),
        }
    }

    fn open(&mut self, tag: String, attributes: BTreeMap<String, String>) {
        let Some(code) = attributes.get(CODE_ATTR).cloned() else {
            let direct_child_of_entity = matches!(self.stack.last(), Some(Frame::Entity { .. }));
            self.stack.push(Frame::Plain {
                tag,
                direct_child_of_entity,
                text: String::new(),
            });
            return;
        };

        let id = format!("{}:{}", tag, code);
        let parent_id = std::mem::replace(&mut self.current_parent, id.clone());
        let attr_name = attributes
            .get(NAME_ATTR)
            .map(|n| n.trim().to_string())
            .unwrap_or_default();

        let slot = self.register(Entity {
            id,
            entity_type: tag,
            name: String::new(),
            parent_id: parent_id.clone(),
            attributes,
            children: Vec::new(),
        });

        self.stack.push(Frame::Entity {
            slot,
            parent_id,
            attr_name,
            child_name: None,
        });
    }

    fn register(&mut self, entity: Entity) -> Slot {
        let index = &mut self.index;
        if index.entities.contains_key(&entity.id) {
            index.duplicates.push(entity);
            return Slot::Duplicate(index.duplicates.len() - 1);
        }

        let id = entity.id.clone();
        if !entity.parent_id.is_empty() {
            index
                .by_parent
                .entry(entity.parent_id.clone())
                .or_default()
                .push(id.clone());
            // A dangling parent reference is tolerated.
            if let Some(parent) = index.entities.get_mut(&entity.parent_id) {
                parent.children.push(id.clone());
            }
        }
        index
            .by_type
            .entry(entity.entity_type.clone())
            .or_default()
            .push(id.clone());
        index.entities.insert(id.clone(), entity);

        Slot::Primary(id)
    }

    fn text(&mut self, chunk: &str) {
        if let Some(Frame::Plain { text, .. }) = self.stack.last_mut() {
            text.push_str(chunk);
        }
    }

    fn close(&mut self) {
        match self.stack.pop() {
            Some(Frame::Entity {
                slot,
                parent_id,
                attr_name,
                child_name,
            }) => {
                let name = if attr_name.is_empty() {
                    child_name.unwrap_or_default()
                } else {
                    attr_name
                };
                if let Some(entity) = self.entity_mut(&slot) {
                    entity.name = name;
                }
                self.current_parent = parent_id;
            }
            Some(Frame::Plain {
                tag,
                direct_child_of_entity,
                text,
            }) => {
                let value = text.trim();
                if value.is_empty() {
                    return;
                }
                if direct_child_of_entity && NAME_TAGS.contains(&tag.as_str()) {
                    if let Some(Frame::Entity { child_name, .. }) = self.stack.last_mut() {
                        child_name.get_or_insert_with(|| value.to_string());
                    }
                }
                self.fold_attribute(tag, value);
            }
            None => {}
        }
    }

    /// Folds a child element's text into the innermost open entity.
    fn fold_attribute(&mut self, tag: String, value: &str) {
        let Some(slot) = self.stack.iter().rev().find_map(|frame| match frame {
            Frame::Entity { slot, .. } => Some(slot.clone()),
            Frame::Plain { .. } => None,
        }) else {
            return;
        };
        let Some(entity) = self.entity_mut(&slot) else {
            return;
        };

        let existing = entity.attributes.entry(tag).or_default();
        if !existing.is_empty() {
            existing.push_str(", ");
        }
        existing.push_str(value);
    }

    fn entity_mut(&mut self, slot: &Slot) -> Option<&mut Entity> {
        match slot {
            Slot::Primary(id) => self.index.entities.get_mut(id),
            Slot::Duplicate(i) => self.index.duplicates.get_mut(*i),
        }
    }

    /// Name of the innermost element still open, if any.
    fn unclosed(&self) -> Option<String> {
        self.stack.last().map(|frame| match frame {
            Frame::Entity { slot, .. } => match slot {
                Slot::Primary(id) => id.clone(),
                Slot::Duplicate(i) => self
                    .index
                    .duplicates
                    .get(*i)
                    .map(|e| e.id.clone())
                    .unwrap_or_default(),
            },
            Frame::Plain { tag, .. } => tag.clone(),
        })
    }

    fn finish(self) -> EntityIndex {
        let mut index = self.index;

        let mut sorted_ids: Vec<String> = index.entities.keys().cloned().collect();
        sorted_ids.sort();
        index.sorted_ids = sorted_ids;

        index.stats = IndexStats {
            total_entities: index.entities.len(),
            type_counts: index
                .by_type
                .iter()
                .map(|(t, ids)| (t.clone(), ids.len()))
                .collect(),
        };
        index
    }
}

/// Splits a start tag into its local name and namespace-stripped attributes.
///
/// Namespace declarations (`xmlns`, `xmlns:*`) are skipped.
pub(crate) fn element_parts(
    element: &BytesStart<'_>,
) -> std::result::Result<(String, BTreeMap<String, String>), quick_xml::Error> {
    let tag = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
    let mut attributes = BTreeMap::new();

    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.insert(key, value);
    }

    Ok((tag, attributes))
}

pub(crate) fn xml_error(path: &str, position: u64, err: impl Display) -> XmlGraphError {
    XmlGraphError::Xml {
        message: err.to_string(),
        path: path.to_string(),
        position,
    }
}

/// Builds an entity index from raw XML bytes in a single streaming pass.
///
/// Any element carrying a `code` attribute becomes an entity with ID
/// `<local-name>:<code>`. Text of other elements is folded into the
/// innermost enclosing entity's attributes. Malformed input aborts the
/// build; no partial index is returned.
pub fn build_index(bytes: &[u8], source_file: &str, commit_sha: &str) -> Result<EntityIndex> {
    let started = Instant::now();
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut builder = IndexBuilder::new(source_file, commit_sha);

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => return Err(xml_error(source_file, reader.error_position() as u64, e)),
        };
        let position = reader.buffer_position() as u64;

        match event {
            Event::Start(e) => {
                let (tag, attributes) =
                    element_parts(&e).map_err(|err| xml_error(source_file, position, err))?;
                builder.open(tag, attributes);
            }
            Event::Empty(e) => {
                let (tag, attributes) =
                    element_parts(&e).map_err(|err| xml_error(source_file, position, err))?;
                builder.open(tag, attributes);
                builder.close();
            }
            Event::End(_) => builder.close(),
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|err| xml_error(source_file, position, err))?;
                builder.text(&text);
            }
            Event::CData(e) => {
                let raw = e.into_inner();
                builder.text(&String::from_utf8_lossy(&raw));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = builder.unclosed() {
        return Err(xml_error(
            source_file,
            reader.buffer_position() as u64,
            format!("unexpected end of document: <{}> is not closed", open),
        ));
    }

    let index = builder.finish();
    debug!(
        source = source_file,
        entities = index.stats.total_entities,
        duplicates = index.duplicates.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "index built"
    );
    Ok(index)
}
