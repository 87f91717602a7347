use itertools::Itertools;
use log::{debug, trace};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use crate::error::{MergeError, MergeResult};
use crate::model::{
    names_match, CompositeKey, EntityGraph, EntityKey, EntityType, KeySide, MetadataProvider,
    NodeId, NodeKey, PropertyDef, RelationDef, RelationValue, RestrictedSurface, ScalarType,
};
use crate::store::traits::EntityLoader;

type NestedMerge<'b> = Pin<Box<dyn Future<Output = MergeResult<NodeId>> + Send + 'b>>;

/// Merges update documents onto an [`EntityGraph`].
///
/// Rows referenced by id are loaded through the [`EntityLoader`] together with
/// the relations the document touches. Document values are written onto the
/// nodes; original collection members missing from a document array get their
/// key flagged for deletion so the reconciler can pick them up.
pub struct DocumentMerger<'a, M: ?Sized, L: ?Sized> {
    metadata: &'a M,
    loader: &'a L,
    surface: &'a RestrictedSurface,
}

impl<'a, M, L> DocumentMerger<'a, M, L>
where
    M: MetadataProvider + ?Sized,
    L: EntityLoader + ?Sized,
{
    pub fn new(metadata: &'a M, loader: &'a L, surface: &'a RestrictedSurface) -> Self {
        Self {
            metadata,
            loader,
            surface,
        }
    }

    /// Merge `document` into the graph as an entity of `entity_type`.
    ///
    /// `root_id` overrides the document's own id; `Some(0)` forces a new row.
    /// Returns the handle of the root node.
    pub async fn merge(
        &self,
        graph: &mut EntityGraph,
        document: &Value,
        root_id: Option<i64>,
        entity_type: &str,
    ) -> MergeResult<NodeId> {
        let descriptor = self
            .metadata
            .entity_type(entity_type)
            .ok_or_else(|| MergeError::UnknownEntityType(entity_type.to_string()))?;
        let object = document
            .as_object()
            .ok_or_else(|| MergeError::invalid(entity_type, "$", "update document must be an object"))?;

        let id = match root_id {
            Some(i64::MIN) => {
                return Err(MergeError::invalid(
                    &descriptor.name,
                    descriptor.key_property().unwrap_or("id"),
                    format!("{} is out of range for a key", i64::MIN),
                ))
            }
            Some(id) => id,
            None => Self::document_id(descriptor, object)?,
        };

        let root = self.resolve_node(graph, descriptor, object, id).await?;
        self.merge_object(graph, root, descriptor, object).await?;
        debug!(
            "merged {} document into {} {} ({} nodes in graph)",
            entity_type,
            root,
            graph.node(root).key,
            graph.len()
        );
        Ok(root)
    }

    /// Read the single-key field of a document; missing or null means new
    pub fn document_id(descriptor: &EntityType, object: &Map<String, Value>) -> MergeResult<i64> {
        let property = match descriptor.key_property() {
            Some(property) => property,
            None => return Ok(0),
        };
        let value = object
            .iter()
            .find(|(name, _)| names_match(property, name))
            .map(|(_, value)| value);

        match value {
            None | Some(Value::Null) => Ok(0),
            Some(value) => signed_integer(value)
                .map_err(|reason| MergeError::invalid(&descriptor.name, property, reason)),
        }
    }

    /// Relations the loader must include so the document can be merged
    fn required_relations(&self, descriptor: &EntityType, object: &Map<String, Value>) -> Vec<String> {
        descriptor
            .relations
            .iter()
            .filter(|relation| {
                !self.surface.is_restricted_type(&relation.target)
                    && self.metadata.entity_type(&relation.target).is_some()
            })
            .filter(|relation| {
                if relation.is_single_many_to_many() {
                    return true;
                }
                let value = object
                    .iter()
                    .find(|(name, _)| names_match(&relation.name, name))
                    .map(|(_, value)| value);
                match value {
                    None => false,
                    Some(Value::Array(items)) => !items.is_empty(),
                    Some(Value::Null) => !relation.is_collection(),
                    Some(_) => true,
                }
            })
            .map(|relation| relation.name.clone())
            .collect()
    }

    /// Find, load or create the node a document refers to
    async fn resolve_node(
        &self,
        graph: &mut EntityGraph,
        descriptor: &EntityType,
        object: &Map<String, Value>,
        id: i64,
    ) -> MergeResult<NodeId> {
        if descriptor.is_junction() {
            return Ok(graph.add_node(&descriptor.name, NodeKey::Composite(CompositeKey::default())));
        }
        if id == 0 {
            trace!("new {} node", descriptor.name);
            return Ok(graph.add_node(&descriptor.name, NodeKey::Single(EntityKey::New)));
        }

        let row_id = id.saturating_abs();
        let required = self.required_relations(descriptor, object);

        let cached = graph
            .find(&descriptor.name, row_id)
            .filter(|node| required.iter().all(|r| graph.node(*node).is_loaded(r)));

        let node = match cached {
            Some(node) => {
                trace!("{} {} already in graph as {}", descriptor.name, row_id, node);
                node
            }
            None => {
                debug!(
                    "loading {} {} with relations [{}]",
                    descriptor.name,
                    row_id,
                    required.iter().join(", ")
                );
                let record = self
                    .loader
                    .load_with_relations(&descriptor.name, row_id, &required)
                    .await?
                    .ok_or_else(|| MergeError::NotFound {
                        entity_type: descriptor.name.clone(),
                        id: row_id,
                    })?;
                graph.materialize(record)
            }
        };

        if id < 0 {
            flag_for_removal(graph, node);
        }
        Ok(node)
    }

    /// Resolve a nested document (or reuse a correlated node) and merge into it
    fn merge_nested<'b>(
        &'b self,
        graph: &'b mut EntityGraph,
        descriptor: &'b EntityType,
        object: &'b Map<String, Value>,
        reuse: Option<NodeId>,
    ) -> NestedMerge<'b> {
        Box::pin(async move {
            let node = match reuse {
                Some(node) => node,
                None => {
                    let id = Self::document_id(descriptor, object)?;
                    self.resolve_node(graph, descriptor, object, id).await?
                }
            };
            self.merge_object(graph, node, descriptor, object).await?;
            Ok(node)
        })
    }

    async fn merge_object(
        &self,
        graph: &mut EntityGraph,
        node: NodeId,
        descriptor: &EntityType,
        object: &Map<String, Value>,
    ) -> MergeResult<()> {
        self.check_foreign_keys(descriptor, object)?;

        for (name, value) in object {
            if descriptor
                .key_property()
                .map_or(false, |key| names_match(key, name))
            {
                continue;
            }

            if let Some(side) = descriptor.key_side(name) {
                merge_key_component(graph, node, descriptor, side, value)?;
                continue;
            }

            if let Some(property) = descriptor.find_property(name) {
                if self.surface.is_restricted_property(&property.name) {
                    trace!("skipping restricted property {}.{}", descriptor.name, property.name);
                    continue;
                }
                merge_field(graph, node, descriptor, property, value)?;
                continue;
            }

            if let Some(relation) = descriptor.find_relation(name) {
                if self.surface.is_restricted_type(&relation.target) {
                    trace!(
                        "skipping relation {}.{} to restricted type {}",
                        descriptor.name,
                        relation.name,
                        relation.target
                    );
                    continue;
                }
                let target = match self.metadata.entity_type(&relation.target) {
                    Some(target) => target,
                    None => {
                        trace!("{} has no metadata, leaving it opaque", relation.target);
                        continue;
                    }
                };
                self.merge_relation(graph, node, descriptor, relation, target, value)
                    .await?;
                continue;
            }

            if let Some(field) = descriptor.find_field(name) {
                let restricted = self.surface.is_restricted_property(&field.name)
                    || field
                        .references
                        .as_deref()
                        .map_or(false, |t| self.surface.is_restricted_type(t));
                if field.writable && !restricted {
                    let coerced = field
                        .data_type
                        .coerce(value, true)
                        .map_err(|reason| MergeError::invalid(&descriptor.name, &field.name, reason))?;
                    graph
                        .node_mut(node)
                        .extras
                        .insert(field.name.clone(), coerced);
                }
                continue;
            }

            trace!("ignoring unknown field {}.{}", descriptor.name, name);
        }
        Ok(())
    }

    /// Run before any field is merged, so a conflicting nested object is never loaded
    fn check_foreign_keys(&self, descriptor: &EntityType, object: &Map<String, Value>) -> MergeResult<()> {
        for (name, value) in object {
            let foreign_key = match descriptor.key_side(name) {
                Some(side) => side_name(descriptor, side),
                None => match descriptor.find_property(name) {
                    Some(property) if !self.surface.is_restricted_property(&property.name) => {
                        &property.name
                    }
                    _ => continue,
                },
            };
            self.check_foreign_key(descriptor, foreign_key, value, object)?;
        }
        Ok(())
    }

    /// A non-zero scalar foreign key must agree with the nested object of its relation
    fn check_foreign_key(
        &self,
        descriptor: &EntityType,
        foreign_key: &str,
        value: &Value,
        object: &Map<String, Value>,
    ) -> MergeResult<()> {
        let relation = match descriptor.relation_for_foreign_key(foreign_key) {
            Some(relation) => relation,
            None => return Ok(()),
        };
        let foreign_key_value = match signed_integer(value) {
            Ok(v) if v != 0 => v,
            _ => return Ok(()),
        };
        let nested = object
            .iter()
            .find(|(name, _)| names_match(&relation.name, name))
            .and_then(|(_, value)| value.as_object());
        let nested = match nested {
            Some(nested) => nested,
            None => return Ok(()),
        };

        let relation_id = match self.metadata.entity_type(&relation.target) {
            Some(target) => Self::document_id(target, nested)?,
            None => nested
                .get("id")
                .map(signed_integer)
                .transpose()
                .map_err(|reason| MergeError::invalid(&relation.target, "id", reason))?
                .unwrap_or(0),
        };

        if foreign_key_value.saturating_abs() != relation_id.saturating_abs() {
            return Err(MergeError::Conflict {
                entity_type: descriptor.name.clone(),
                foreign_key: foreign_key.to_string(),
                foreign_key_value,
                relation: relation.name.clone(),
                relation_id,
            });
        }
        Ok(())
    }

    async fn merge_relation(
        &self,
        graph: &mut EntityGraph,
        node: NodeId,
        descriptor: &EntityType,
        relation: &RelationDef,
        target: &EntityType,
        value: &Value,
    ) -> MergeResult<()> {
        if relation.is_collection() {
            return match value {
                Value::Null => Ok(()),
                Value::Array(items) if items.is_empty() => Ok(()),
                Value::Array(items) => {
                    self.merge_collection(graph, node, descriptor, relation, target, items)
                        .await
                }
                _ => Err(MergeError::invalid(
                    &descriptor.name,
                    &relation.name,
                    "expected an array",
                )),
            };
        }

        match value {
            Value::Null => {
                graph.set_relation(node, &relation.name, RelationValue::One(None));
                Ok(())
            }
            Value::Object(nested) => {
                let reuse = if target.is_junction() {
                    check_link_owner(graph, node, relation, target, nested)?;
                    let current = match graph.node(node).relation(&relation.name) {
                        Some(RelationValue::One(Some(current))) => vec![*current],
                        _ => Vec::new(),
                    };
                    correlate_junction(graph, target, &current, &HashSet::new(), nested)?
                } else {
                    None
                };
                let child = self
                    .merge_nested(graph, target, nested, reuse)
                    .await?;
                graph.set_relation(node, &relation.name, RelationValue::One(Some(child)));
                Ok(())
            }
            _ => Err(MergeError::invalid(
                &descriptor.name,
                &relation.name,
                "expected an object or null",
            )),
        }
    }

    /// Merge every array element, then flag originals the array left out
    async fn merge_collection(
        &self,
        graph: &mut EntityGraph,
        owner: NodeId,
        descriptor: &EntityType,
        relation: &RelationDef,
        target: &EntityType,
        items: &[Value],
    ) -> MergeResult<()> {
        let originals = graph
            .node(owner)
            .relation(&relation.name)
            .map(|value| value.nodes())
            .unwrap_or_default();

        let mut merged: Vec<NodeId> = Vec::with_capacity(items.len());
        let mut matched = HashSet::new();

        for item in items {
            let nested = item.as_object().ok_or_else(|| {
                MergeError::invalid(
                    &descriptor.name,
                    &relation.name,
                    "collection elements must be objects",
                )
            })?;

            let reuse = if target.is_junction() {
                check_link_owner(graph, owner, relation, target, nested)?;
                correlate_junction(graph, target, &originals, &matched, nested)?
            } else {
                None
            };

            let child = self.merge_nested(graph, target, nested, reuse).await?;
            if originals.contains(&child) {
                matched.insert(child);
            }
            if !merged.contains(&child) {
                merged.push(child);
            }
        }

        for original in originals {
            if !matched.contains(&original) {
                trace!(
                    "{} {} left out of {}.{}, flagging for removal",
                    graph.node(original).entity_type,
                    graph.node(original).key,
                    descriptor.name,
                    relation.name
                );
                flag_for_removal(graph, original);
                merged.push(original);
            }
        }

        graph.set_relation(owner, &relation.name, RelationValue::Many(merged));
        Ok(())
    }
}

fn side_name(descriptor: &EntityType, side: KeySide) -> &str {
    descriptor.key_side_name(side).unwrap_or_default()
}

fn signed_integer(value: &Value) -> Result<i64, String> {
    let id = ScalarType::Integer
        .coerce(value, true)
        .map(|v| v.as_i64().unwrap_or(0))?;
    // -i64::MIN has no i64 representation
    if id == i64::MIN {
        return Err(format!("{} is out of range for a key", id));
    }
    Ok(id)
}

fn merge_field(
    graph: &mut EntityGraph,
    node: NodeId,
    descriptor: &EntityType,
    property: &PropertyDef,
    value: &Value,
) -> MergeResult<()> {
    let coerced = property
        .data_type
        .coerce(value, property.nullable)
        .map_err(|reason| MergeError::invalid(&descriptor.name, &property.name, reason))?;
    let entity = graph.node_mut(node);
    entity.fields.insert(property.name.clone(), coerced);
    entity.mark_assigned(&property.name);
    Ok(())
}

fn merge_key_component(
    graph: &mut EntityGraph,
    node: NodeId,
    descriptor: &EntityType,
    side: KeySide,
    value: &Value,
) -> MergeResult<()> {
    let signed = signed_integer(value)
        .map_err(|reason| MergeError::invalid(&descriptor.name, side_name(descriptor, side), reason))?;
    let mut key = graph.node(node).composite_key().unwrap_or_default();
    match side {
        KeySide::Main => key.main = EntityKey::from_signed(signed),
        KeySide::Other => key.other = EntityKey::from_signed(signed),
    }
    graph.set_key(node, NodeKey::Composite(key));
    Ok(())
}

/// A link under an existing owner may only name that owner on its main side.
/// Links under a new owner get the owner's id at flush.
fn check_link_owner(
    graph: &EntityGraph,
    owner: NodeId,
    relation: &RelationDef,
    target: &EntityType,
    object: &Map<String, Value>,
) -> MergeResult<()> {
    let owner_id = match graph.node(owner).single_key().and_then(|k| k.id()) {
        Some(id) => id,
        None => return Ok(()),
    };
    let main = object
        .iter()
        .find(|(name, _)| target.key_side(name) == Some(KeySide::Main))
        .map(|(_, value)| value);
    let main = match main {
        None | Some(Value::Null) => return Ok(()),
        Some(value) => signed_integer(value).map_err(|reason| {
            MergeError::invalid(&target.name, side_name(target, KeySide::Main), reason)
        })?,
    };

    if main != 0 && main.saturating_abs() != owner_id {
        return Err(MergeError::Conflict {
            entity_type: target.name.clone(),
            foreign_key: side_name(target, KeySide::Main).to_string(),
            foreign_key_value: main,
            relation: relation.name.clone(),
            relation_id: owner_id,
        });
    }
    Ok(())
}

/// Original junction row with the same linked id as the document element
fn correlate_junction(
    graph: &EntityGraph,
    target: &EntityType,
    originals: &[NodeId],
    matched: &HashSet<NodeId>,
    object: &Map<String, Value>,
) -> MergeResult<Option<NodeId>> {
    let other = object
        .iter()
        .find(|(name, _)| target.key_side(name) == Some(KeySide::Other))
        .map(|(_, value)| value);
    let other = match other {
        Some(value) => signed_integer(value).map_err(|reason| {
            MergeError::invalid(&target.name, side_name(target, KeySide::Other), reason)
        })?,
        None => return Ok(None),
    };
    if other == 0 {
        return Ok(None);
    }

    let other = other.saturating_abs();
    Ok(originals.iter().copied().find(|original| {
        !matched.contains(original)
            && graph
                .node(*original)
                .composite_key()
                .and_then(|key| key.other.id())
                == Some(other)
    }))
}

/// Single-key rows get their key marked; junction rows get their linked side marked
fn flag_for_removal(graph: &mut EntityGraph, node: NodeId) {
    let key = match graph.node(node).key {
        NodeKey::Single(mut key) => {
            key.mark_for_deletion();
            NodeKey::Single(key)
        }
        NodeKey::Composite(mut key) => {
            key.other.mark_for_deletion();
            NodeKey::Composite(key)
        }
    };
    graph.set_key(node, key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelationKind, TypeRegistry};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .with_type(
                EntityType::new("Item")
                    .property("name", ScalarType::String)
                    .nullable_property("color", ScalarType::String)
                    .property("group_id", ScalarType::Integer)
                    .nullable_property("released_at", ScalarType::Timestamp)
                    .view_field("preview_url", ScalarType::String)
                    .relation(
                        "parts",
                        "ItemPart",
                        RelationKind::ToMany {
                            inverse_foreign_key: Some("item_id".to_string()),
                        },
                    )
                    .relation("tags", "ItemTag", RelationKind::ManyToMany { collection: true }),
            )
            .with_type(
                EntityType::new("ItemPart")
                    .property("path", ScalarType::String)
                    .nullable_property("item_id", ScalarType::Integer)
                    .relation(
                        "item",
                        "Item",
                        RelationKind::ToOne {
                            foreign_key: Some("item_id".to_string()),
                        },
                    ),
            )
            .with_type(EntityType::junction("ItemTag", "item_id", "tag_id"))
            .build()
            .unwrap()
    }

    fn store(registry: &Arc<TypeRegistry>) -> MemoryStore {
        let store = MemoryStore::new(registry.clone());
        store
            .seed("Item", json!({"id": 1, "name": "Hat", "group_id": 4}))
            .unwrap();
        store
            .seed("ItemPart", json!({"id": 5, "path": "a.png", "item_id": 1}))
            .unwrap();
        store
            .seed("ItemPart", json!({"id": 7, "path": "b.png", "item_id": 1}))
            .unwrap();
        store.seed("ItemTag", json!({"item_id": 1, "tag_id": 10})).unwrap();
        store.seed("ItemTag", json!({"item_id": 1, "tag_id": 11})).unwrap();
        store
    }

    #[tokio::test]
    async fn test_collection_correlation_flags_missing_originals() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let root = merger
            .merge(
                &mut graph,
                &json!({"id": 1, "parts": [{"id": 7, "path": "b2.png"}, {"id": 0, "path": "c.png"}]}),
                None,
                "Item",
            )
            .await
            .unwrap();

        let parts = graph.node(root).relation("parts").unwrap().nodes();
        assert_eq!(parts.len(), 3);

        let keys: Vec<EntityKey> = parts
            .iter()
            .map(|p| graph.node(*p).single_key().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                EntityKey::Existing(7),
                EntityKey::New,
                EntityKey::MarkedForDeletion(5)
            ]
        );
        assert_eq!(graph.node(parts[0]).fields["path"], json!("b2.png"));
    }

    #[tokio::test]
    async fn test_junction_elements_correlate_by_linked_id() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let root = merger
            .merge(
                &mut graph,
                &json!({"id": 1, "tags": [{"tagId": 11}, {"tagId": 12}]}),
                None,
                "Item",
            )
            .await
            .unwrap();

        let links: Vec<CompositeKey> = graph
            .node(root)
            .relation("tags")
            .unwrap()
            .nodes()
            .iter()
            .map(|l| graph.node(*l).composite_key().unwrap())
            .collect();
        assert_eq!(
            links,
            vec![
                CompositeKey {
                    main: EntityKey::Existing(1),
                    other: EntityKey::Existing(11)
                },
                CompositeKey {
                    main: EntityKey::New,
                    other: EntityKey::Existing(12)
                },
                CompositeKey {
                    main: EntityKey::Existing(1),
                    other: EntityKey::MarkedForDeletion(10)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_link_must_name_its_existing_owner() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let root = merger
            .merge(
                &mut graph,
                &json!({"id": 1, "tags": [{"itemId": 1, "tagId": 11}, {"itemId": -1, "tagId": 10}]}),
                None,
                "Item",
            )
            .await
            .unwrap();
        assert_eq!(graph.node(root).relation("tags").unwrap().nodes().len(), 2);

        let err = merger
            .merge(
                &mut EntityGraph::new(),
                &json!({"id": 1, "tags": [{"itemId": 2, "tagId": 12}]}),
                None,
                "Item",
            )
            .await
            .unwrap_err();
        match err {
            MergeError::Conflict {
                entity_type,
                foreign_key,
                foreign_key_value,
                relation,
                relation_id,
            } => {
                assert_eq!(entity_type, "ItemTag");
                assert_eq!(foreign_key, "item_id");
                assert_eq!(foreign_key_value, 2);
                assert_eq!(relation, "tags");
                assert_eq!(relation_id, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restricted_and_unknown_fields_are_ignored() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let root = merger
            .merge(
                &mut graph,
                &json!({
                    "id": 1,
                    "groupId": 99,
                    "nickname": "ignored",
                    "previewUrl": "https://cdn/1.png",
                    "releasedAt": "2024-05-01T12:00:00+02:00"
                }),
                None,
                "Item",
            )
            .await
            .unwrap();

        let node = graph.node(root);
        assert_eq!(node.fields["group_id"], json!(4));
        assert!(!node.fields.contains_key("nickname"));
        assert_eq!(node.extras["preview_url"], json!("https://cdn/1.png"));
        assert_eq!(node.fields["released_at"], json!("2024-05-01T10:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_root_id_overrides_document_id() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let root = merger
            .merge(&mut graph, &json!({"id": 1, "name": "Copy"}), Some(0), "Item")
            .await
            .unwrap();
        assert_eq!(graph.node(root).single_key(), Some(EntityKey::New));

        let err = merger
            .merge(&mut graph, &json!({"id": "one"}), None, "Item")
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_unrepresentable_negative_id_is_invalid() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let err = merger
            .merge(&mut graph, &json!({"id": i64::MIN}), None, "Item")
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidValue { .. }));

        let err = merger
            .merge(&mut graph, &json!({"name": "Hat"}), Some(i64::MIN), "Item")
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidValue { .. }));
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_key_must_match_nested_relation() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let err = merger
            .merge(
                &mut graph,
                &json!({"id": 5, "itemId": 1, "item": {"id": 2}}),
                None,
                "ItemPart",
            )
            .await
            .unwrap_err();
        match err {
            MergeError::Conflict {
                foreign_key,
                foreign_key_value,
                relation_id,
                ..
            } => {
                assert_eq!(foreign_key, "item_id");
                assert_eq!(foreign_key_value, 1);
                assert_eq!(relation_id, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        // Same row on both sides, sign ignored
        merger
            .merge(
                &mut graph,
                &json!({"id": 5, "itemId": 1, "item": {"id": -1}}),
                None,
                "ItemPart",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let err = merger
            .merge(&mut graph, &json!({"id": -404}), None, "Item")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MergeError::NotFound { ref entity_type, id: 404 } if entity_type == "Item"
        ));

        let err = merger
            .merge(&mut graph, &json!({}), None, "Nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::UnknownEntityType(_)));
    }

    #[tokio::test]
    async fn test_empty_and_null_collections_leave_originals_alone() {
        let registry = Arc::new(registry());
        let store = store(&registry);
        let surface = RestrictedSurface::default();
        let merger = DocumentMerger::new(registry.as_ref(), &store, &surface);
        let mut graph = EntityGraph::new();

        let root = merger
            .merge(&mut graph, &json!({"id": 1, "parts": [], "tags": null}), None, "Item")
            .await
            .unwrap();

        assert!(!graph.node(root).is_loaded("parts"));
        assert!(!graph.node(root).is_loaded("tags"));

        let err = merger
            .merge(&mut graph, &json!({"id": 1, "parts": {"id": 5}}), None, "Item")
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidValue { .. }));
    }
}
