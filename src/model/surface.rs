use serde::{Deserialize, Serialize};

use crate::model::names_match;

/// Ownership-sensitive surface that update documents can never write.
///
/// Restricted properties are skipped wherever they appear; relations and
/// view fields that point at a restricted type are skipped as well, and the
/// reconciler leaves nested rows of those types untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictedSurface {
    pub properties: Vec<String>,
    pub target_types: Vec<String>,
}

impl Default for RestrictedSurface {
    fn default() -> Self {
        Self {
            properties: vec!["group_id".to_string(), "uploader_user_id".to_string()],
            target_types: vec!["Group".to_string(), "User".to_string()],
        }
    }
}

impl RestrictedSurface {
    pub fn new(properties: Vec<String>, target_types: Vec<String>) -> Self {
        Self {
            properties,
            target_types,
        }
    }

    /// A surface that restricts nothing
    pub fn open() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn is_restricted_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| names_match(p, name))
    }

    pub fn is_restricted_type(&self, entity_type: &str) -> bool {
        self.target_types.iter().any(|t| t == entity_type)
    }
}
