use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::model::{ChangeState, EntityGraph, EntityNode, EntityRecord, NodeId, OrphanedLink, RecordKey};

/// Fetches stored rows together with the relations a merge needs.
#[async_trait::async_trait]
pub trait EntityLoader: Send + Sync {
    /// Load row `id` of `entity_type`, including the named relations one level deep.
    /// Returns `Ok(None)` when the row does not exist.
    async fn load_with_relations(
        &self,
        entity_type: &str,
        id: i64,
        relations: &[String],
    ) -> Result<Option<EntityRecord>>;
}

/// Receives change states for the nodes of one unit of work and writes them out.
#[async_trait::async_trait]
pub trait PersistenceSession: Send {
    /// Whether the node (or another node holding the same row) already has a state
    fn is_tracked(&self, node: NodeId, entity: &EntityNode) -> bool;

    /// Assign a state; a later call for the same node replaces the earlier one
    fn attach(&mut self, node: NodeId, entity: &EntityNode, state: ChangeState);

    fn state_of(&self, node: NodeId) -> Option<ChangeState>;

    /// A junction row was taken out of its owner's collection
    fn detach_link(&mut self, _link: OrphanedLink) {}

    /// Write every tracked node to the backing store
    async fn flush(&mut self, graph: &mut EntityGraph) -> Result<FlushReport>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRef {
    pub entity_type: String,
    pub key: RecordKey,
}

/// Rows written by a flush, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub created: Vec<RowRef>,
    pub updated: Vec<RowRef>,
    pub deleted: Vec<RowRef>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}
