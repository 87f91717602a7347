use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::model::{CompositeKey, Entity, EntityKey, KeyShape, MetadataProvider, NodeKey};

/// Opaque handle of a node inside an [`EntityGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationValue {
    One(Option<NodeId>),
    Many(Vec<NodeId>),
}

impl RelationValue {
    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            RelationValue::One(node) => node.iter().copied().collect(),
            RelationValue::Many(nodes) => nodes.clone(),
        }
    }
}

/// In-memory instance of an entity.
#[derive(Debug, Clone)]
pub struct EntityNode {
    pub entity_type: String,
    pub key: NodeKey,
    /// Persisted scalar properties
    pub fields: Map<String, Value>,
    /// View-only fields, never persisted
    pub extras: Map<String, Value>,
    /// Loaded or assigned relations; an absent entry means "not loaded"
    pub relations: BTreeMap<String, RelationValue>,
    /// Relations as they were when materialized from the store
    loaded: BTreeMap<String, RelationValue>,
    /// Properties written from a document since the last flush
    assigned: BTreeSet<String>,
}

impl EntityNode {
    fn new(entity_type: String, key: NodeKey) -> Self {
        Self {
            entity_type,
            key,
            fields: Map::new(),
            extras: Map::new(),
            relations: BTreeMap::new(),
            loaded: BTreeMap::new(),
            assigned: BTreeSet::new(),
        }
    }

    pub fn single_key(&self) -> Option<EntityKey> {
        self.key.single()
    }

    pub fn composite_key(&self) -> Option<CompositeKey> {
        self.key.composite()
    }

    pub fn is_loaded(&self, relation: &str) -> bool {
        self.relations.contains_key(relation)
    }

    pub fn loaded_relation(&self, relation: &str) -> Option<&RelationValue> {
        self.loaded.get(relation)
    }

    pub fn relation(&self, relation: &str) -> Option<&RelationValue> {
        self.relations.get(relation)
    }

    /// Whether a document wrote `property` since the last flush
    pub fn was_assigned(&self, property: &str) -> bool {
        self.assigned.contains(property)
    }

    pub(crate) fn mark_assigned(&mut self, property: &str) {
        self.assigned.insert(property.to_string());
    }
}

/// Key of a stored row as returned by a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Single(i64),
    Composite { main: i64, other: i64 },
}

impl RecordKey {
    fn to_node_key(self) -> NodeKey {
        match self {
            RecordKey::Single(id) => NodeKey::Single(EntityKey::from_signed(id)),
            RecordKey::Composite { main, other } => NodeKey::Composite(CompositeKey {
                main: EntityKey::from_signed(main),
                other: EntityKey::from_signed(other),
            }),
        }
    }
}

/// A stored row plus the relations a loader was asked to include.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub key: RecordKey,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub relations: BTreeMap<String, RecordRelation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordRelation {
    One(Option<Box<EntityRecord>>),
    Many(Vec<EntityRecord>),
}

/// Arena holding every node of one unit of work.
///
/// Relations refer to nodes by [`NodeId`], so back-references and cycles are
/// ordinary data. Single-key rows are identity-resolved: materializing a row
/// that is already present returns the existing handle.
#[derive(Debug, Clone, Default)]
pub struct EntityGraph {
    nodes: Vec<EntityNode>,
    index: HashMap<(String, i64), NodeId>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node behind `id`, or `None` when the handle belongs to another graph
    pub fn get(&self, id: NodeId) -> Option<&EntityNode> {
        self.nodes.get(id.0)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    /// Forget which properties documents wrote, once they are persisted
    pub(crate) fn clear_assignments(&mut self) {
        for node in &mut self.nodes {
            node.assigned.clear();
        }
    }

    pub fn node(&self, id: NodeId) -> &EntityNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut EntityNode {
        &mut self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &EntityNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Add a node that does not come from the store
    pub fn add_node(&mut self, entity_type: &str, key: NodeKey) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(EntityNode::new(entity_type.to_string(), key));
        self.reindex(id);
        id
    }

    /// Find the node holding the row `id` of `entity_type`
    pub fn find(&self, entity_type: &str, id: i64) -> Option<NodeId> {
        self.index.get(&(entity_type.to_string(), id)).copied()
    }

    pub fn set_key(&mut self, node: NodeId, key: NodeKey) {
        if let Some(old) = self.nodes[node.0].key.single().and_then(|k| k.id()) {
            let entry = (self.nodes[node.0].entity_type.clone(), old);
            if self.index.get(&entry) == Some(&node) {
                self.index.remove(&entry);
            }
        }
        self.nodes[node.0].key = key;
        self.reindex(node);
    }

    fn reindex(&mut self, node: NodeId) {
        let entry = &self.nodes[node.0];
        if let Some(id) = entry.key.single().and_then(|k| k.id()) {
            self.index
                .entry((entry.entity_type.clone(), id))
                .or_insert(node);
        }
    }

    pub fn set_relation(&mut self, node: NodeId, relation: &str, value: RelationValue) {
        self.nodes[node.0]
            .relations
            .insert(relation.to_string(), value);
    }

    pub fn remove_from_collection(&mut self, node: NodeId, relation: &str, items: &[NodeId]) {
        if let Some(RelationValue::Many(members)) = self.nodes[node.0].relations.get_mut(relation) {
            members.retain(|m| !items.contains(m));
        }
    }

    /// Bring a loaded record (and its included relations) into the arena.
    ///
    /// Already-present rows keep their in-memory state; only fields and
    /// relations they do not have yet are filled in.
    pub fn materialize(&mut self, record: EntityRecord) -> NodeId {
        let key = record.key.to_node_key();
        let existing = key
            .single()
            .and_then(|k| k.id())
            .and_then(|id| self.find(&record.entity_type, id));

        let node_id = match existing {
            Some(node_id) => node_id,
            None => self.add_node(&record.entity_type, key),
        };

        {
            let node = &mut self.nodes[node_id.0];
            for (name, value) in record.fields {
                node.fields.entry(name).or_insert(value);
            }
        }

        for (name, relation) in record.relations {
            let value = match relation {
                RecordRelation::One(related) => {
                    RelationValue::One(related.map(|r| self.materialize(*r)))
                }
                RecordRelation::Many(related) => RelationValue::Many(
                    related.into_iter().map(|r| self.materialize(r)).collect(),
                ),
            };
            let node = &mut self.nodes[node_id.0];
            node.loaded.entry(name.clone()).or_insert_with(|| value.clone());
            node.relations.entry(name).or_insert(value);
        }

        node_id
    }

    /// Render a node tree as a JSON document using metadata names.
    ///
    /// Nodes already on the current path are rendered as a bare key object,
    /// so back-references do not recurse.
    pub fn to_document<M: MetadataProvider + ?Sized>(&self, metadata: &M, node: NodeId) -> Value {
        let mut path = HashSet::new();
        self.render(metadata, node, &mut path)
    }

    fn render<M: MetadataProvider + ?Sized>(
        &self,
        metadata: &M,
        node_id: NodeId,
        path: &mut HashSet<NodeId>,
    ) -> Value {
        let node = &self.nodes[node_id.0];
        let mut out = Map::new();

        let key_shape = metadata.entity_type(&node.entity_type).map(|t| &t.key);
        match (node.key, key_shape) {
            (NodeKey::Single(key), Some(KeyShape::Single { property })) => {
                out.insert(property.clone(), Value::from(key.to_signed()));
            }
            (
                NodeKey::Composite(key),
                Some(KeyShape::Composite {
                    main_side,
                    other_side,
                }),
            ) => {
                out.insert(main_side.clone(), Value::from(key.main.to_signed()));
                out.insert(other_side.clone(), Value::from(key.other.to_signed()));
            }
            (NodeKey::Single(key), _) => {
                out.insert("id".to_string(), Value::from(key.to_signed()));
            }
            (NodeKey::Composite(key), _) => {
                out.insert("main".to_string(), Value::from(key.main.to_signed()));
                out.insert("other".to_string(), Value::from(key.other.to_signed()));
            }
        }

        if !path.insert(node_id) {
            return Value::Object(out);
        }

        for (name, value) in node.fields.iter().chain(node.extras.iter()) {
            out.insert(name.clone(), value.clone());
        }

        for (name, relation) in &node.relations {
            let rendered = match relation {
                RelationValue::One(None) => Value::Null,
                RelationValue::One(Some(child)) => self.render(metadata, *child, path),
                RelationValue::Many(children) => Value::Array(
                    children
                        .iter()
                        .map(|child| self.render(metadata, *child, path))
                        .collect(),
                ),
            };
            out.insert(name.clone(), rendered);
        }

        path.remove(&node_id);
        Value::Object(out)
    }

    /// Deserialize a node tree into a typed entity
    pub fn extract<E: Entity, M: MetadataProvider + ?Sized>(
        &self,
        metadata: &M,
        node: NodeId,
    ) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.to_document(metadata, node))
    }
}
