use anyhow::{anyhow, bail, Result};
use log::{debug, trace, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::model::{
    ChangeState, CompositeKey, EntityGraph, EntityKey, EntityNode, EntityRecord, EntityType,
    KeyShape, KeySide, MetadataProvider, NodeId, NodeKey, OrphanedLink, RecordKey, RecordRelation,
    RelationKind, RelationValue,
};
use crate::store::traits::{EntityLoader, FlushReport, PersistenceSession, RowRef};

type Row = Map<String, Value>;

/// Row store held in memory, shared by every session created from it.
pub struct MemoryStore {
    metadata: Arc<dyn MetadataProvider>,
    rows: RwLock<BTreeMap<(String, RecordKey), Row>>,
    /// Highest id handed out per entity type
    sequences: RwLock<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new(metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            metadata,
            rows: RwLock::new(BTreeMap::new()),
            sequences: RwLock::new(HashMap::new()),
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataProvider> {
        &self.metadata
    }

    /// Open a session writing into this store
    pub fn session(self: &Arc<Self>) -> MemorySession {
        MemorySession::new(Arc::clone(self))
    }

    /// Store a row under an explicit key, replacing any previous row
    pub fn insert(&self, entity_type: &str, key: RecordKey, fields: Row) {
        if let RecordKey::Single(id) = key {
            let mut sequences = self.sequences.write();
            let current = sequences.entry(entity_type.to_string()).or_insert(0);
            *current = (*current).max(id);
        }
        self.rows
            .write()
            .insert((entity_type.to_string(), key), fields);
    }

    /// Store a row given as a flat JSON object; the key is read from the
    /// type's key fields.
    pub fn seed(&self, entity_type: &str, row: Value) -> Result<RecordKey> {
        let descriptor = self
            .metadata
            .entity_type(entity_type)
            .ok_or_else(|| anyhow!("no metadata for entity type {}", entity_type))?;
        let mut fields = match row {
            Value::Object(fields) => fields,
            other => bail!("seed row for {} must be an object, got {}", entity_type, other),
        };

        let mut take_id = |name: &str| -> Result<i64> {
            fields
                .remove(name)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| anyhow!("seed row for {} is missing integer {}", entity_type, name))
        };

        let key = match &descriptor.key {
            KeyShape::Single { property } => RecordKey::Single(take_id(property)?),
            KeyShape::Composite {
                main_side,
                other_side,
            } => RecordKey::Composite {
                main: take_id(main_side)?,
                other: take_id(other_side)?,
            },
        };

        self.insert(entity_type, key, fields);
        Ok(key)
    }

    pub fn get(&self, entity_type: &str, key: RecordKey) -> Option<Row> {
        self.rows
            .read()
            .get(&(entity_type.to_string(), key))
            .cloned()
    }

    pub fn contains(&self, entity_type: &str, key: RecordKey) -> bool {
        self.rows
            .read()
            .contains_key(&(entity_type.to_string(), key))
    }

    pub fn count(&self, entity_type: &str) -> usize {
        self.rows
            .read()
            .keys()
            .filter(|(t, _)| t == entity_type)
            .count()
    }

    /// Reserve the next id for a new row of `entity_type`
    pub fn next_id(&self, entity_type: &str) -> i64 {
        let mut sequences = self.sequences.write();
        let current = sequences.entry(entity_type.to_string()).or_insert(0);
        *current += 1;
        *current
    }

    fn remove(&self, entity_type: &str, key: RecordKey) -> bool {
        self.rows
            .write()
            .remove(&(entity_type.to_string(), key))
            .is_some()
    }

    fn update(&self, entity_type: &str, key: RecordKey, fields: Row) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(&(entity_type.to_string(), key))
            .ok_or_else(|| anyhow!("cannot update {} {:?}: row does not exist", entity_type, key))?;
        row.extend(fields);
        Ok(())
    }

    fn shallow_record(
        rows: &BTreeMap<(String, RecordKey), Row>,
        entity_type: &str,
        key: RecordKey,
    ) -> Option<EntityRecord> {
        rows.get(&(entity_type.to_string(), key)).map(|fields| EntityRecord {
                entity_type: entity_type.to_string(),
                key,
                fields: fields.clone(),
                relations: BTreeMap::new(),
            })
    }

    fn records_where<F>(
        rows: &BTreeMap<(String, RecordKey), Row>,
        entity_type: &str,
        predicate: F,
    ) -> Vec<EntityRecord>
    where
        F: Fn(&RecordKey, &Row) -> bool,
    {
        rows.iter()
            .filter(|((t, key), fields)| t == entity_type && predicate(key, *fields))
            .map(|((t, key), fields)| EntityRecord {
                entity_type: t.clone(),
                key: *key,
                fields: fields.clone(),
                relations: BTreeMap::new(),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl EntityLoader for MemoryStore {
    async fn load_with_relations(
        &self,
        entity_type: &str,
        id: i64,
        relations: &[String],
    ) -> Result<Option<EntityRecord>> {
        let descriptor = self
            .metadata
            .entity_type(entity_type)
            .ok_or_else(|| anyhow!("no metadata for entity type {}", entity_type))?;

        let rows = self.rows.read();
        let mut record = match Self::shallow_record(&rows, entity_type, RecordKey::Single(id)) {
            Some(record) => record,
            None => return Ok(None),
        };

        for name in relations {
            let relation = match descriptor.relation_by_name(name) {
                Some(relation) => relation,
                None => {
                    warn!("{} has no relation named {}, not loading it", entity_type, name);
                    continue;
                }
            };

            let loaded = match &relation.kind {
                RelationKind::ToOne { foreign_key } => {
                    let target_id = foreign_key
                        .as_deref()
                        .and_then(|fk| record.fields.get(fk))
                        .and_then(Value::as_i64)
                        .filter(|v| *v != 0);
                    RecordRelation::One(
                        target_id
                            .and_then(|tid| {
                                Self::shallow_record(&rows, &relation.target, RecordKey::Single(tid))
                            })
                            .map(Box::new),
                    )
                }
                RelationKind::ToMany {
                    inverse_foreign_key,
                } => match inverse_foreign_key {
                    Some(inverse) => RecordRelation::Many(Self::records_where(
                        &rows,
                        &relation.target,
                        |_, fields| fields.get(inverse).and_then(Value::as_i64) == Some(id),
                    )),
                    None => RecordRelation::Many(Vec::new()),
                },
                RelationKind::ManyToMany { collection } => {
                    let links = Self::records_where(&rows, &relation.target, |key, _| {
                        matches!(key, RecordKey::Composite { main, .. } if *main == id)
                    });
                    if *collection {
                        RecordRelation::Many(links)
                    } else {
                        RecordRelation::One(links.into_iter().next().map(Box::new))
                    }
                }
            };

            record.relations.insert(relation.name.clone(), loaded);
        }

        trace!(
            "loaded {} {} with {} relation(s)",
            entity_type,
            id,
            record.relations.len()
        );
        Ok(Some(record))
    }
}

/// Session over a [`MemoryStore`]: identity map, ordered change log and a
/// two-phase flush.
pub struct MemorySession {
    store: Arc<MemoryStore>,
    states: HashMap<NodeId, ChangeState>,
    order: Vec<NodeId>,
    identities: HashMap<(String, i64), NodeId>,
    orphans: Vec<OrphanedLink>,
}

impl MemorySession {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            states: HashMap::new(),
            order: Vec::new(),
            identities: HashMap::new(),
            orphans: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Tracked nodes and their states, in attach order
    pub fn changes(&self) -> Vec<(NodeId, ChangeState)> {
        self.order
            .iter()
            .filter_map(|node| self.states.get(node).map(|state| (*node, *state)))
            .collect()
    }

    pub fn orphans(&self) -> &[OrphanedLink] {
        &self.orphans
    }

    fn nodes_in(&self, state: ChangeState) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|node| self.states.get(node) == Some(&state))
            .collect()
    }

    fn reset(&mut self) {
        self.states.clear();
        self.order.clear();
        self.identities.clear();
        self.orphans.clear();
    }

    /// Give every created single-key row a fresh id
    fn assign_ids(&self, graph: &mut EntityGraph) {
        for node in self.nodes_in(ChangeState::Create) {
            let entity = graph.node(node);
            if entity.single_key() == Some(EntityKey::New) {
                let id = self.store.next_id(&entity.entity_type);
                debug!("assigned id {} to new {} {}", id, entity.entity_type, node);
                graph.set_key(node, NodeKey::Single(EntityKey::Existing(id)));
            }
        }
    }

    /// Copy related ids into foreign keys and junction key components
    fn fix_foreign_keys(&self, graph: &mut EntityGraph) {
        let mut pending = self.nodes_in(ChangeState::Create);
        pending.extend(self.nodes_in(ChangeState::Update));

        for node in pending {
            let entity_type = match self.store.metadata.entity_type(&graph.node(node).entity_type) {
                Some(t) => t,
                None => continue,
            };
            let owner_id = match graph.node(node).single_key() {
                Some(EntityKey::Existing(id)) => Some(id),
                _ => None,
            };

            for relation in &entity_type.relations {
                let value = match graph.node(node).relation(&relation.name) {
                    Some(value) => value.clone(),
                    None => continue,
                };

                match (&relation.kind, value) {
                    (RelationKind::ToOne { foreign_key: Some(fk) }, RelationValue::One(target)) => {
                        let target_id = target
                            .and_then(|t| graph.node(t).single_key())
                            .and_then(|k| k.id());
                        set_foreign_key(graph, node, entity_type, fk, target_id);
                    }
                    (
                        RelationKind::ToMany {
                            inverse_foreign_key: Some(inverse),
                        },
                        RelationValue::Many(children),
                    ) => {
                        if let Some(owner_id) = owner_id {
                            for child in children {
                                if graph.node(child).key.is_composite() {
                                    continue;
                                }
                                graph
                                    .node_mut(child)
                                    .fields
                                    .insert(inverse.clone(), Value::from(owner_id));
                            }
                        }
                    }
                    (RelationKind::ManyToMany { .. }, value) => {
                        if let Some(owner_id) = owner_id {
                            for link in value.nodes() {
                                // created links always belong to the owner they hang under
                                let created = self.states.get(&link) == Some(&ChangeState::Create);
                                if let Some(mut key) = graph.node(link).composite_key() {
                                    let foreign = key.main.id() != Some(owner_id);
                                    if key.main.is_new() || (created && foreign) {
                                        key.main = EntityKey::Existing(owner_id);
                                        graph.set_key(link, NodeKey::Composite(key));
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn row_key(entity: &EntityNode) -> Option<RecordKey> {
        match entity.key {
            NodeKey::Single(key) => key.id().map(RecordKey::Single),
            NodeKey::Composite(CompositeKey { main, other }) => match (main.id(), other.id()) {
                (Some(main), Some(other)) => Some(RecordKey::Composite { main, other }),
                _ => None,
            },
        }
    }

    fn persisted_fields(entity_type: Option<&EntityType>, entity: &EntityNode) -> Row {
        match entity_type {
            Some(t) => entity
                .fields
                .iter()
                .filter(|(name, _)| t.properties.iter().any(|p| &p.name == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => entity.fields.clone(),
        }
    }

    fn delete_row(&self, entity: &EntityNode, report: &mut FlushReport) {
        let key = match Self::row_key(entity) {
            Some(key) => key,
            None => return,
        };
        if self.store.remove(&entity.entity_type, key) {
            report.deleted.push(RowRef {
                entity_type: entity.entity_type.clone(),
                key,
            });
        } else {
            warn!("{} {:?} was already gone", entity.entity_type, key);
        }
    }
}

fn set_foreign_key(
    graph: &mut EntityGraph,
    node: NodeId,
    entity_type: &EntityType,
    foreign_key: &str,
    target_id: Option<i64>,
) {
    if let Some(side) = entity_type.key_side(foreign_key) {
        let (Some(mut key), Some(target_id)) = (graph.node(node).composite_key(), target_id) else {
            return;
        };
        let component = match side {
            KeySide::Main => &mut key.main,
            KeySide::Other => &mut key.other,
        };
        if component.is_new() {
            *component = EntityKey::Existing(target_id);
            graph.set_key(node, NodeKey::Composite(key));
        }
        return;
    }

    let nullable = entity_type
        .properties
        .iter()
        .find(|p| p.name == foreign_key)
        .map(|p| p.nullable)
        .unwrap_or(false);
    match target_id {
        Some(id) => {
            graph
                .node_mut(node)
                .fields
                .insert(foreign_key.to_string(), Value::from(id));
        }
        // a foreign key written by the document outlives a cleared relation
        None if nullable && !graph.node(node).was_assigned(foreign_key) => {
            graph
                .node_mut(node)
                .fields
                .insert(foreign_key.to_string(), Value::Null);
        }
        None => {}
    }
}

#[async_trait::async_trait]
impl PersistenceSession for MemorySession {
    fn is_tracked(&self, node: NodeId, entity: &EntityNode) -> bool {
        if self.states.contains_key(&node) {
            return true;
        }
        entity
            .single_key()
            .and_then(|k| k.id())
            .map(|id| {
                self.identities
                    .contains_key(&(entity.entity_type.clone(), id))
            })
            .unwrap_or(false)
    }

    fn attach(&mut self, node: NodeId, entity: &EntityNode, state: ChangeState) {
        if self.states.insert(node, state).is_none() {
            self.order.push(node);
        }
        if let Some(id) = entity.single_key().and_then(|k| k.id()) {
            self.identities
                .entry((entity.entity_type.clone(), id))
                .or_insert(node);
        }
        trace!("{} {} {} -> {}", entity.entity_type, entity.key, node, state);
    }

    fn state_of(&self, node: NodeId) -> Option<ChangeState> {
        self.states.get(&node).copied()
    }

    fn detach_link(&mut self, link: OrphanedLink) {
        self.orphans.push(link);
    }

    async fn flush(&mut self, graph: &mut EntityGraph) -> Result<FlushReport> {
        self.assign_ids(graph);
        self.fix_foreign_keys(graph);

        let mut report = FlushReport::default();

        for link in &self.orphans {
            self.delete_row(graph.node(link.link), &mut report);
        }
        for node in self.nodes_in(ChangeState::Delete) {
            self.delete_row(graph.node(node), &mut report);
        }

        for state in [ChangeState::Create, ChangeState::Update] {
            for node in self.nodes_in(state) {
                let entity = graph.node(node);
                let key = Self::row_key(entity).ok_or_else(|| {
                    anyhow!(
                        "{} {} has no resolvable key at flush",
                        entity.entity_type,
                        entity.key
                    )
                })?;
                let fields = Self::persisted_fields(
                    self.store.metadata.entity_type(&entity.entity_type),
                    entity,
                );
                let row = RowRef {
                    entity_type: entity.entity_type.clone(),
                    key,
                };

                if state == ChangeState::Create {
                    self.store.insert(&entity.entity_type, key, fields);
                    report.created.push(row);
                } else {
                    self.store.update(&entity.entity_type, key, fields)?;
                    report.updated.push(row);
                }
            }
        }

        debug!(
            "flushed {} created, {} updated, {} deleted",
            report.created.len(),
            report.updated.len(),
            report.deleted.len()
        );
        graph.clear_assignments();
        self.reset();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, ScalarType, TypeRegistry};
    use serde_json::json;

    fn store() -> Arc<MemoryStore> {
        let registry = TypeRegistry::builder()
            .with_type(
                EntityType::new("Item")
                    .property("name", ScalarType::String)
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
                    .nullable_property("item_id", ScalarType::Integer),
            )
            .with_type(EntityType::junction("ItemTag", "item_id", "tag_id"))
            .build()
            .unwrap();

        let store = Arc::new(MemoryStore::new(Arc::new(registry)));
        store.seed("Item", json!({"id": 1, "name": "Hat"})).unwrap();
        store
            .seed("ItemPart", json!({"id": 5, "path": "a.png", "item_id": 1}))
            .unwrap();
        store
            .seed("ItemPart", json!({"id": 6, "path": "b.png", "item_id": 2}))
            .unwrap();
        store.seed("ItemTag", json!({"item_id": 1, "tag_id": 9})).unwrap();
        store
    }

    #[tokio::test]
    async fn test_load_includes_only_requested_relations() {
        let store = store();

        let bare = store.load_with_relations("Item", 1, &[]).await.unwrap().unwrap();
        assert!(bare.relations.is_empty());
        assert_eq!(bare.fields["name"], json!("Hat"));

        let full = store
            .load_with_relations("Item", 1, &["parts".to_string(), "tags".to_string()])
            .await
            .unwrap()
            .unwrap();
        match &full.relations["parts"] {
            RecordRelation::Many(parts) => {
                assert_eq!(parts.len(), 1);
                assert_eq!(parts[0].key, RecordKey::Single(5));
            }
            other => panic!("unexpected parts relation: {:?}", other),
        }
        match &full.relations["tags"] {
            RecordRelation::Many(tags) => {
                assert_eq!(tags[0].key, RecordKey::Composite { main: 1, other: 9 });
            }
            other => panic!("unexpected tags relation: {:?}", other),
        }

        assert!(store.load_with_relations("Item", 99, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_assigns_ids_and_fixes_foreign_keys() {
        let store = store();
        let mut session = store.session();
        let mut graph = EntityGraph::new();

        let item = graph.add_node("Item", NodeKey::Single(EntityKey::New));
        graph.node_mut(item).fields.insert("name".into(), json!("Scarf"));
        let part = graph.add_node("ItemPart", NodeKey::Single(EntityKey::New));
        graph.node_mut(part).fields.insert("path".into(), json!("c.png"));
        let link = graph.add_node(
            "ItemTag",
            NodeKey::Composite(CompositeKey {
                main: EntityKey::New,
                other: EntityKey::Existing(9),
            }),
        );
        graph.set_relation(item, "parts", RelationValue::Many(vec![part]));
        graph.set_relation(item, "tags", RelationValue::Many(vec![link]));

        for node in [item, part, link] {
            let entity = graph.node(node).clone();
            session.attach(node, &entity, ChangeState::Create);
        }

        let report = session.flush(&mut graph).await.unwrap();
        assert_eq!(report.created.len(), 3);
        assert!(report.deleted.is_empty());

        // Item ids continue after the seeded row
        assert_eq!(graph.node(item).single_key(), Some(EntityKey::Existing(2)));
        let stored_part = store.get("ItemPart", RecordKey::Single(7)).unwrap();
        assert_eq!(stored_part["item_id"], json!(2));
        assert!(store.contains("ItemTag", RecordKey::Composite { main: 2, other: 9 }));
        assert!(session.changes().is_empty());
    }

    #[tokio::test]
    async fn test_flush_deletes_orphaned_links_before_writes() {
        let store = store();
        let mut session = store.session();
        let mut graph = EntityGraph::new();

        let item = graph.add_node("Item", NodeKey::Single(EntityKey::Existing(1)));
        let link = graph.add_node(
            "ItemTag",
            NodeKey::Composite(CompositeKey {
                main: EntityKey::Existing(1),
                other: EntityKey::MarkedForDeletion(9),
            }),
        );
        let entity = graph.node(item).clone();
        session.attach(item, &entity, ChangeState::Update);
        session.detach_link(OrphanedLink {
            owner: item,
            relation: "tags".to_string(),
            link,
        });

        let report = session.flush(&mut graph).await.unwrap();
        assert_eq!(
            report.deleted,
            vec![RowRef {
                entity_type: "ItemTag".to_string(),
                key: RecordKey::Composite { main: 1, other: 9 },
            }]
        );
        assert_eq!(store.count("ItemTag"), 0);
    }

    #[tokio::test]
    async fn test_update_of_missing_row_fails() {
        let store = store();
        let mut session = store.session();
        let mut graph = EntityGraph::new();

        let ghost = graph.add_node("Item", NodeKey::Single(EntityKey::Existing(50)));
        let entity = graph.node(ghost).clone();
        session.attach(ghost, &entity, ChangeState::Update);

        assert!(session.flush(&mut graph).await.is_err());
    }

    #[test]
    fn test_identity_map_tracks_by_row() {
        let store = store();
        let mut session = store.session();
        let mut graph = EntityGraph::new();

        let first = graph.add_node("Item", NodeKey::Single(EntityKey::Existing(1)));
        let entity = graph.node(first).clone();
        session.attach(first, &entity, ChangeState::Update);

        // A second handle for the same row counts as tracked
        let twin = EntityNode::clone(graph.node(first));
        let other = graph.add_node("Item", NodeKey::Single(EntityKey::New));
        assert!(session.is_tracked(other, &twin));
        assert!(!session.is_tracked(other, graph.node(other)));
        assert_eq!(session.state_of(first), Some(ChangeState::Update));
    }
}
