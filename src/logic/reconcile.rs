use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::model::{
    ChangeState, CompositeKey, EntityGraph, EntityKey, KeyState, MetadataProvider,
    NodeId, NodeKey, OrphanedLink, RelationDef, RelationValue, RestrictedSurface,
};
use crate::store::traits::PersistenceSession;

/// Counts of the states assigned during one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Junction rows taken out of their owner's collection
    pub detached: usize,
}

impl ReconcileSummary {
    fn record(&mut self, state: ChangeState) {
        match state {
            ChangeState::Create => self.created += 1,
            ChangeState::Update => self.updated += 1,
            ChangeState::Delete => self.deleted += 1,
            ChangeState::NoOp => self.unchanged += 1,
        }
    }

    /// Total number of nodes that received a state
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.unchanged
    }
}

/// What the parent should do with a visited collection member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Keep,
    RemoveFromParent,
}

/// Assigns a [`ChangeState`] to every node reachable from a root.
///
/// Only the key of a node decides its state; the session's identity map
/// doubles as the visited set, so back-references terminate.
pub struct ChangeReconciler<'a, M: ?Sized> {
    metadata: &'a M,
    surface: &'a RestrictedSurface,
}

impl<'a, M: MetadataProvider + ?Sized> ChangeReconciler<'a, M> {
    pub fn new(metadata: &'a M, surface: &'a RestrictedSurface) -> Self {
        Self { metadata, surface }
    }

    pub fn apply<S: PersistenceSession + ?Sized>(
        &self,
        graph: &mut EntityGraph,
        session: &mut S,
        root: NodeId,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        self.visit(graph, session, root, None, &mut summary);
        debug!(
            "reconciled from {}: {} created, {} updated, {} deleted, {} unchanged, {} detached",
            root,
            summary.created,
            summary.updated,
            summary.deleted,
            summary.unchanged,
            summary.detached
        );
        summary
    }

    fn visit<S: PersistenceSession + ?Sized>(
        &self,
        graph: &mut EntityGraph,
        session: &mut S,
        node: NodeId,
        parent: Option<(NodeId, &RelationDef)>,
        summary: &mut ReconcileSummary,
    ) -> Visit {
        let entity_type = match self.metadata.entity_type(&graph.node(node).entity_type) {
            Some(entity_type) => entity_type,
            None => {
                trace!("{} is opaque, skipping", graph.node(node).entity_type);
                return Visit::Keep;
            }
        };

        if session.is_tracked(node, graph.node(node)) {
            return Visit::Keep;
        }

        let (state, visit) = match graph.node(node).key {
            NodeKey::Single(key) => (classify(key), Visit::Keep),
            NodeKey::Composite(key) => match parent {
                Some((owner, relation)) => classify_junction(graph, owner, relation, key),
                None => (classify_root_junction(key), Visit::Keep),
            },
        };

        if parent.is_some() && self.surface.is_restricted_type(&entity_type.name) {
            trace!("{} {} is restricted, leaving it unchanged", entity_type.name, node);
            session.attach(node, graph.node(node), ChangeState::NoOp);
            summary.record(ChangeState::NoOp);
            return visit;
        }

        session.attach(node, graph.node(node), state);
        summary.record(state);

        for relation in &entity_type.relations {
            if relation.is_single_many_to_many() {
                self.replace_single_link(graph, session, node, relation, summary);
                continue;
            }

            let value = match graph.node(node).relation(&relation.name) {
                Some(value) => value.clone(),
                None => continue,
            };

            match value {
                RelationValue::One(None) => {}
                RelationValue::One(Some(child)) => {
                    self.visit(graph, session, child, Some((node, relation)), summary);
                }
                RelationValue::Many(children) => {
                    let removed: Vec<NodeId> = children
                        .into_iter()
                        .filter(|child| {
                            self.visit(graph, session, *child, Some((node, relation)), summary)
                                == Visit::RemoveFromParent
                        })
                        .collect();

                    if removed.is_empty() {
                        continue;
                    }
                    graph.remove_from_collection(node, &relation.name, &removed);
                    for link in removed {
                        session.detach_link(OrphanedLink {
                            owner: node,
                            relation: relation.name.clone(),
                            link,
                        });
                        summary.detached += 1;
                    }
                }
            }
        }

        visit
    }

    /// A single-valued many-to-many relation replaces whatever was stored:
    /// loaded rows other than the current value are deleted and a new
    /// current value is created against the owner.
    fn replace_single_link<S: PersistenceSession + ?Sized>(
        &self,
        graph: &mut EntityGraph,
        session: &mut S,
        owner: NodeId,
        relation: &RelationDef,
        summary: &mut ReconcileSummary,
    ) {
        if self.metadata.entity_type(&relation.target).is_none() {
            return;
        }

        let owner_key = graph.node(owner).single_key();
        let owner_deleted = matches!(owner_key, Some(EntityKey::MarkedForDeletion(_)));
        let current = match graph.node(owner).relation(&relation.name) {
            Some(RelationValue::One(current)) => *current,
            _ => None,
        };
        let originals = graph
            .node(owner)
            .loaded_relation(&relation.name)
            .map(RelationValue::nodes)
            .unwrap_or_default();

        for original in &originals {
            if current == Some(*original) && !owner_deleted {
                continue;
            }
            if session.is_tracked(*original, graph.node(*original)) {
                continue;
            }
            session.attach(*original, graph.node(*original), ChangeState::Delete);
            summary.record(ChangeState::Delete);
        }

        let current = match current {
            Some(current) if !owner_deleted => current,
            _ => return,
        };
        if session.is_tracked(current, graph.node(current)) {
            return;
        }

        let mut key = match graph.node(current).composite_key() {
            Some(key) => key,
            None => return,
        };

        let state = if originals.contains(&current) {
            if is_flagged(&key) {
                ChangeState::Delete
            } else {
                ChangeState::NoOp
            }
        } else {
            if let (true, Some(EntityKey::Existing(owner_id))) = (key.main.is_new(), owner_key) {
                key.main = EntityKey::Existing(owner_id);
                graph.set_key(current, NodeKey::Composite(key));
            }
            ChangeState::Create
        };

        trace!(
            "{}.{} single link {} -> {}",
            graph.node(owner).entity_type,
            relation.name,
            current,
            state
        );
        session.attach(current, graph.node(current), state);
        summary.record(state);
    }
}

/// Single-key rows follow their key: new, existing or flagged
fn classify(key: EntityKey) -> ChangeState {
    match key {
        EntityKey::New => ChangeState::Create,
        EntityKey::Existing(_) => ChangeState::Update,
        EntityKey::MarkedForDeletion(_) => ChangeState::Delete,
    }
}

/// Junction rows are never updated in place, only created or removed.
fn classify_junction(
    graph: &EntityGraph,
    owner: NodeId,
    relation: &RelationDef,
    key: CompositeKey,
) -> (ChangeState, Visit) {
    let owner_state = graph
        .node(owner)
        .single_key()
        .map(|k| k.state())
        .unwrap_or(KeyState::Modified);

    match owner_state {
        KeyState::Added => (ChangeState::Create, Visit::Keep),
        KeyState::Deleted => (ChangeState::NoOp, Visit::RemoveFromParent),
        KeyState::Modified => match key.other.state() {
            KeyState::Deleted => (ChangeState::NoOp, Visit::RemoveFromParent),
            KeyState::Added => (ChangeState::Create, Visit::Keep),
            KeyState::Modified if relation.is_collection() && key.main.is_new() => {
                (ChangeState::Create, Visit::Keep)
            }
            KeyState::Modified => (ChangeState::NoOp, Visit::Keep),
        },
    }
}

fn classify_root_junction(key: CompositeKey) -> ChangeState {
    if is_flagged(&key) {
        ChangeState::Delete
    } else if key.main.is_new() || key.other.is_new() {
        ChangeState::Create
    } else {
        ChangeState::NoOp
    }
}

fn is_flagged(key: &CompositeKey) -> bool {
    matches!(key.main, EntityKey::MarkedForDeletion(_))
        || matches!(key.other, EntityKey::MarkedForDeletion(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, RelationKind, ScalarType, TypeRegistry};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
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
                    .relation("tags", "ItemTag", RelationKind::ManyToMany { collection: true })
                    .relation(
                        "group",
                        "Group",
                        RelationKind::ToOne {
                            foreign_key: Some("group_id".to_string()),
                        },
                    ),
            )
            .with_type(EntityType::new("ItemPart").relation(
                "item",
                "Item",
                RelationKind::ToOne {
                    foreign_key: Some("item_id".to_string()),
                },
            ))
            .with_type(EntityType::junction("ItemTag", "item_id", "tag_id"))
            .with_type(EntityType::new("Group"))
            .build()
            .unwrap()
    }

    fn link(graph: &mut EntityGraph, main: EntityKey, other: EntityKey) -> NodeId {
        graph.add_node("ItemTag", NodeKey::Composite(CompositeKey { main, other }))
    }

    #[test]
    fn test_single_key_states_follow_sign() {
        assert_eq!(classify(EntityKey::from_signed(0)), ChangeState::Create);
        assert_eq!(classify(EntityKey::from_signed(8)), ChangeState::Update);
        assert_eq!(classify(EntityKey::from_signed(-8)), ChangeState::Delete);
    }

    #[test]
    fn test_junction_decision_table() {
        let registry = registry();
        let tags = registry
            .entity_type("Item")
            .and_then(|t| t.relation_by_name("tags"))
            .unwrap();
        let mut graph = EntityGraph::new();
        let new_owner = graph.add_node("Item", NodeKey::Single(EntityKey::New));
        let deleted_owner = graph.add_node("Item", NodeKey::Single(EntityKey::MarkedForDeletion(2)));
        let owner = graph.add_node("Item", NodeKey::Single(EntityKey::Existing(3)));

        let key = |main, other| CompositeKey { main, other };
        let cases = [
            (new_owner, key(EntityKey::New, EntityKey::Existing(12)), (ChangeState::Create, Visit::Keep)),
            (deleted_owner, key(EntityKey::Existing(2), EntityKey::Existing(12)), (ChangeState::NoOp, Visit::RemoveFromParent)),
            (owner, key(EntityKey::Existing(3), EntityKey::MarkedForDeletion(12)), (ChangeState::NoOp, Visit::RemoveFromParent)),
            (owner, key(EntityKey::New, EntityKey::Existing(12)), (ChangeState::Create, Visit::Keep)),
            (owner, key(EntityKey::Existing(3), EntityKey::Existing(12)), (ChangeState::NoOp, Visit::Keep)),
            (owner, key(EntityKey::Existing(3), EntityKey::New), (ChangeState::Create, Visit::Keep)),
        ];

        for (owner, key, expected) in cases {
            assert_eq!(classify_junction(&graph, owner, tags, key), expected, "{:?}", key);
        }
    }

    #[test]
    fn test_root_junction_uses_own_key() {
        assert_eq!(
            classify_root_junction(CompositeKey {
                main: EntityKey::Existing(1),
                other: EntityKey::MarkedForDeletion(2)
            }),
            ChangeState::Delete
        );
        assert_eq!(
            classify_root_junction(CompositeKey {
                main: EntityKey::New,
                other: EntityKey::Existing(2)
            }),
            ChangeState::Create
        );
        assert_eq!(
            classify_root_junction(CompositeKey {
                main: EntityKey::Existing(1),
                other: EntityKey::Existing(2)
            }),
            ChangeState::NoOp
        );
    }

    #[test]
    fn test_back_reference_is_visited_once() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new(registry.clone()));
        let mut session = store.session();
        let surface = RestrictedSurface::default();

        let mut graph = EntityGraph::new();
        let item = graph.add_node("Item", NodeKey::Single(EntityKey::Existing(1)));
        let part = graph.add_node("ItemPart", NodeKey::Single(EntityKey::New));
        graph.set_relation(item, "parts", RelationValue::Many(vec![part]));
        graph.set_relation(part, "item", RelationValue::One(Some(item)));

        let summary = ChangeReconciler::new(registry.as_ref(), &surface).apply(&mut graph, &mut session, part);

        assert_eq!(summary.total(), 2);
        assert_eq!(session.state_of(part), Some(ChangeState::Create));
        assert_eq!(session.state_of(item), Some(ChangeState::Update));
    }

    #[test]
    fn test_removed_links_leave_collection_and_restricted_targets_stay_unchanged() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new(registry.clone()));
        let mut session = store.session();
        let surface = RestrictedSurface::default();

        let mut graph = EntityGraph::new();
        let item = graph.add_node("Item", NodeKey::Single(EntityKey::Existing(1)));
        let kept = link(&mut graph, EntityKey::Existing(1), EntityKey::Existing(10));
        let dropped = link(&mut graph, EntityKey::Existing(1), EntityKey::MarkedForDeletion(11));
        let group = graph.add_node("Group", NodeKey::Single(EntityKey::MarkedForDeletion(5)));
        graph.set_relation(item, "tags", RelationValue::Many(vec![kept, dropped]));
        graph.set_relation(item, "group", RelationValue::One(Some(group)));

        let summary = ChangeReconciler::new(registry.as_ref(), &surface).apply(&mut graph, &mut session, item);

        assert_eq!(graph.node(item).relation("tags"), Some(&RelationValue::Many(vec![kept])));
        assert_eq!(summary.detached, 1);
        assert_eq!(summary.deleted, 0);
        assert_eq!(session.orphans().len(), 1);
        assert_eq!(session.state_of(group), Some(ChangeState::NoOp));
        assert_eq!(session.state_of(kept), Some(ChangeState::NoOp));
    }

    #[test]
    fn test_opaque_nodes_get_no_state() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new(registry.clone()));
        let mut session = store.session();
        let surface = RestrictedSurface::default();

        let mut graph = EntityGraph::new();
        let unknown = graph.add_node("Invoice", NodeKey::Single(EntityKey::New));
        let summary = ChangeReconciler::new(registry.as_ref(), &surface).apply(&mut graph, &mut session, unknown);

        assert_eq!(summary, ReconcileSummary::default());
        assert_eq!(session.state_of(unknown), None);
    }
}
