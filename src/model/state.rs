use serde::{Deserialize, Serialize};

use crate::model::NodeId;

/// Persistence intent assigned to a node by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Create,
    Update,
    Delete,
    NoOp,
}

impl std::fmt::Display for ChangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChangeState::Create => write!(f, "create"),
            ChangeState::Update => write!(f, "update"),
            ChangeState::Delete => write!(f, "delete"),
            ChangeState::NoOp => write!(f, "no-op"),
        }
    }
}

/// A junction row taken out of its owner's collection. The row itself is left
/// untouched; the session decides how the dangling link is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedLink {
    pub owner: NodeId,
    pub relation: String,
    pub link: NodeId,
}
