use log::{debug, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MergeResult;
use crate::logic::{ChangeReconciler, DocumentMerger, ReconcileSummary};
use crate::model::{
    ChangeState, EntityGraph, MetadataProvider, NodeId, NodeKey, RestrictedSurface,
};
use crate::store::traits::{EntityLoader, FlushReport, PersistenceSession};

/// One graph and one session for one logical unit of work.
///
/// Documents are merged and reconciled into the same graph; explicit delete
/// marks are collected and applied when the changes are saved. After any error
/// the unit of work should be dropped.
pub struct UnitOfWork<'a, M: ?Sized, L: ?Sized, S> {
    id: Uuid,
    metadata: &'a M,
    loader: &'a L,
    surface: &'a RestrictedSurface,
    session: S,
    graph: EntityGraph,
    pending_deletes: Vec<NodeId>,
}

impl<'a, M, L, S> UnitOfWork<'a, M, L, S>
where
    M: MetadataProvider + ?Sized,
    L: EntityLoader + ?Sized,
    S: PersistenceSession,
{
    pub fn new(metadata: &'a M, loader: &'a L, surface: &'a RestrictedSurface, session: S) -> Self {
        let id = Uuid::new_v4();
        debug!("unit of work {} started", id);
        Self {
            id,
            metadata,
            loader,
            surface,
            session,
            graph: EntityGraph::new(),
            pending_deletes: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Merge a document into the graph and reconcile everything reachable from its root
    pub async fn apply_document(
        &mut self,
        entity_type: &str,
        document: &Value,
        root_id: Option<i64>,
    ) -> MergeResult<NodeId> {
        let merger = DocumentMerger::new(self.metadata, self.loader, self.surface);
        let root = merger
            .merge(&mut self.graph, document, root_id, entity_type)
            .await?;
        let summary = self.track(root);
        info!(
            "[{}] applied {} document: {} created, {} updated, {} deleted, {} unchanged",
            self.id, entity_type, summary.created, summary.updated, summary.deleted, summary.unchanged
        );
        Ok(root)
    }

    /// Reconcile a node that is already in the graph
    pub fn track(&mut self, node: NodeId) -> ReconcileSummary {
        ChangeReconciler::new(self.metadata, self.surface).apply(
            &mut self.graph,
            &mut self.session,
            node,
        )
    }

    pub fn state_of(&self, node: NodeId) -> Option<ChangeState> {
        self.session.state_of(node)
    }

    /// Delete the node's row on save, whatever state it has now.
    /// Returns false for a handle that is not part of this unit's graph.
    pub fn mark_as_deleted(&mut self, node: NodeId) -> bool {
        if !self.graph.contains(node) {
            warn!("[{}] ignoring delete mark for unknown node {}", self.id, node);
            return false;
        }
        if !self.pending_deletes.contains(&node) {
            self.pending_deletes.push(node);
        }
        true
    }

    /// Undo [`mark_as_deleted`](Self::mark_as_deleted); returns whether a mark was removed
    pub fn clear_deletion_mark(&mut self, node: NodeId) -> bool {
        let before = self.pending_deletes.len();
        self.pending_deletes.retain(|n| *n != node);
        before != self.pending_deletes.len()
    }

    pub fn is_marked_for_deletion(&self, node: NodeId) -> bool {
        self.pending_deletes.contains(&node)
    }

    /// Apply pending deletes and flush the session
    pub async fn save_changes(&mut self) -> anyhow::Result<FlushReport> {
        for node in self.pending_deletes.clone() {
            let key = match self.graph.node(node).key {
                NodeKey::Single(mut key) => {
                    key.mark_for_deletion();
                    NodeKey::Single(key)
                }
                NodeKey::Composite(mut key) => {
                    key.other.mark_for_deletion();
                    NodeKey::Composite(key)
                }
            };
            self.graph.set_key(node, key);
            self.session
                .attach(node, self.graph.node(node), ChangeState::Delete);
        }

        let report = self.session.flush(&mut self.graph).await?;
        self.pending_deletes.clear();
        info!(
            "[{}] saved: {} created, {} updated, {} deleted",
            self.id,
            report.created.len(),
            report.updated.len(),
            report.deleted.len()
        );
        Ok(report)
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Render a node tree as a JSON document
    pub fn document(&self, node: NodeId) -> Value {
        self.graph.to_document(self.metadata, node)
    }

    pub fn into_parts(self) -> (EntityGraph, S) {
        (self.graph, self.session)
    }
}
