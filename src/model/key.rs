use serde::{Deserialize, Serialize};

/// Identity intent of a single-key entity.
///
/// Documents encode this as a signed integer: `0` is a new row, a positive
/// value an existing row and a negative value a row to delete. The enum keeps
/// the three cases apart in memory; [`EntityKey::from_signed`] and
/// [`EntityKey::to_signed`] convert at the document boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum EntityKey {
    New,
    Existing(i64),
    MarkedForDeletion(i64),
}

/// Coarse classification of a key, as used by the junction decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Added,
    Modified,
    Deleted,
}

impl EntityKey {
    /// `i64::MIN` has no positive counterpart and saturates; documents carrying it are rejected earlier.
    pub fn from_signed(value: i64) -> Self {
        match value {
            0 => EntityKey::New,
            v if v > 0 => EntityKey::Existing(v),
            v => EntityKey::MarkedForDeletion(v.saturating_neg()),
        }
    }

    pub fn to_signed(&self) -> i64 {
        match self {
            EntityKey::New => 0,
            EntityKey::Existing(id) => *id,
            EntityKey::MarkedForDeletion(id) => -id,
        }
    }

    /// Row id this key refers to, if the row exists in the store
    pub fn id(&self) -> Option<i64> {
        match self {
            EntityKey::New => None,
            EntityKey::Existing(id) | EntityKey::MarkedForDeletion(id) => Some(*id),
        }
    }

    /// Row id a delete must target (the absolute value of the signed key)
    pub fn delete_target(&self) -> Option<i64> {
        match self {
            EntityKey::MarkedForDeletion(id) => Some(*id),
            _ => None,
        }
    }

    pub fn state(&self) -> KeyState {
        match self {
            EntityKey::New => KeyState::Added,
            EntityKey::Existing(_) => KeyState::Modified,
            EntityKey::MarkedForDeletion(_) => KeyState::Deleted,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EntityKey::New)
    }

    /// Flag an existing row for deletion. New keys have nothing to delete and stay new.
    pub fn mark_for_deletion(&mut self) {
        if let EntityKey::Existing(id) = *self {
            *self = EntityKey::MarkedForDeletion(id);
        }
    }
}

impl Default for EntityKey {
    fn default() -> Self {
        EntityKey::New
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EntityKey::New => write!(f, "new"),
            EntityKey::Existing(id) => write!(f, "{}", id),
            EntityKey::MarkedForDeletion(id) => write!(f, "-{}", id),
        }
    }
}

/// Key of a many-to-many junction row: the owner side and the linked side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CompositeKey {
    pub main: EntityKey,
    pub other: EntityKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKey {
    Single(EntityKey),
    Composite(CompositeKey),
}

impl NodeKey {
    pub fn single(&self) -> Option<EntityKey> {
        match self {
            NodeKey::Single(key) => Some(*key),
            NodeKey::Composite(_) => None,
        }
    }

    pub fn composite(&self) -> Option<CompositeKey> {
        match self {
            NodeKey::Composite(key) => Some(*key),
            NodeKey::Single(_) => None,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, NodeKey::Composite(_))
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            NodeKey::Single(key) => write!(f, "{}", key),
            NodeKey::Composite(key) => write!(f, "({}, {})", key.main, key.other),
        }
    }
}
