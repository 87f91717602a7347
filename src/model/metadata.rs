use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::RegistryError;
use crate::model::Entity;

/// Semantic type of a scalar property. Document values are coerced into it
/// before they are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ScalarType {
    Integer,
    Float,
    Boolean,
    String,
    /// RFC 3339 timestamp, stored normalized to UTC
    Timestamp,
    /// Any JSON value, stored as-is
    Json,
}

impl ScalarType {
    /// Coerce a document value into this type.
    pub fn coerce(&self, value: &Value, nullable: bool) -> Result<Value, String> {
        if value.is_null() {
            return if nullable || *self == ScalarType::Json {
                Ok(Value::Null)
            } else {
                Err("null is not allowed".to_string())
            };
        }

        match self {
            ScalarType::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .map(Value::from)
                    .ok_or_else(|| format!("{} is not an integer", n)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{}' is not an integer", s)),
                other => Err(format!("expected integer, got {}", json_kind(other))),
            },
            ScalarType::Float => value
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| format!("expected number, got {}", json_kind(value))),
            ScalarType::Boolean => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| format!("expected boolean, got {}", json_kind(value))),
            ScalarType::String => value
                .as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(|| format!("expected string, got {}", json_kind(value))),
            ScalarType::Timestamp => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| format!("expected timestamp string, got {}", json_kind(value)))?;
                let parsed = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {}", raw, e))?;
                Ok(Value::String(parsed.with_timezone(&Utc).to_rfc3339()))
            }
            ScalarType::Json => Ok(value.clone()),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Document field names match metadata names when they agree after dropping
/// underscores and case, so `uploaderUserId` reaches `uploader_user_id`.
pub fn names_match(metadata_name: &str, document_name: &str) -> bool {
    let mut a = metadata_name.chars().filter(|c| *c != '_');
    let mut b = document_name.chars().filter(|c| *c != '_');
    loop {
        match (a.next(), b.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x.eq_ignore_ascii_case(&y) => continue,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum KeyShape {
    Single { property: String },
    /// Junction row keyed by the owner id (main side) and the linked id (other side)
    Composite { main_side: String, other_side: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySide {
    Main,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub data_type: ScalarType,
    #[serde(default)]
    pub nullable: bool,
}

/// A view-only field: writable on the in-memory node but never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub data_type: ScalarType,
    #[serde(default = "default_writable")]
    pub writable: bool,
    /// Entity type the field refers to, if any; checked against restricted types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

fn default_writable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationKind {
    /// Single related row; `foreign_key` names the scalar on this entity that holds its id
    ToOne {
        #[serde(default)]
        foreign_key: Option<String>,
    },
    /// Owned collection; `inverse_foreign_key` names the scalar on the target pointing back
    ToMany {
        #[serde(default)]
        inverse_foreign_key: Option<String>,
    },
    /// Rows of a junction type; `collection == false` exposes a single junction row
    ManyToMany { collection: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
}

impl RelationDef {
    pub fn is_collection(&self) -> bool {
        match self.kind {
            RelationKind::ToOne { .. } => false,
            RelationKind::ToMany { .. } => true,
            RelationKind::ManyToMany { collection } => collection,
        }
    }

    pub fn is_single_many_to_many(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToMany { collection: false })
    }

    pub fn foreign_key(&self) -> Option<&str> {
        match &self.kind {
            RelationKind::ToOne { foreign_key } => foreign_key.as_deref(),
            _ => None,
        }
    }
}

/// Schema of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    pub name: String,
    pub key: KeyShape,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: KeyShape::Single {
                property: "id".to_string(),
            },
            properties: Vec::new(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn junction(
        name: impl Into<String>,
        main_side: impl Into<String>,
        other_side: impl Into<String>,
    ) -> Self {
        Self {
            key: KeyShape::Composite {
                main_side: main_side.into(),
                other_side: other_side.into(),
            },
            ..Self::new(name)
        }
    }

    pub fn property(mut self, name: &str, data_type: ScalarType) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_string(),
            data_type,
            nullable: false,
        });
        self
    }

    pub fn nullable_property(mut self, name: &str, data_type: ScalarType) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_string(),
            data_type,
            nullable: true,
        });
        self
    }

    pub fn view_field(mut self, name: &str, data_type: ScalarType) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            data_type,
            writable: true,
            references: None,
        });
        self
    }

    pub fn relation(mut self, name: &str, target: &str, kind: RelationKind) -> Self {
        self.relations.push(RelationDef {
            name: name.to_string(),
            target: target.to_string(),
            kind,
        });
        self
    }

    pub fn is_junction(&self) -> bool {
        matches!(self.key, KeyShape::Composite { .. })
    }

    /// Document field holding the single key, if this type has one
    pub fn key_property(&self) -> Option<&str> {
        match &self.key {
            KeyShape::Single { property } => Some(property),
            KeyShape::Composite { .. } => None,
        }
    }

    pub fn key_side(&self, document_name: &str) -> Option<KeySide> {
        match &self.key {
            KeyShape::Composite {
                main_side,
                other_side,
            } => {
                if names_match(main_side, document_name) {
                    Some(KeySide::Main)
                } else if names_match(other_side, document_name) {
                    Some(KeySide::Other)
                } else {
                    None
                }
            }
            KeyShape::Single { .. } => None,
        }
    }

    pub fn key_side_name(&self, side: KeySide) -> Option<&str> {
        match (&self.key, side) {
            (KeyShape::Composite { main_side, .. }, KeySide::Main) => Some(main_side),
            (KeyShape::Composite { other_side, .. }, KeySide::Other) => Some(other_side),
            _ => None,
        }
    }

    pub fn find_property(&self, document_name: &str) -> Option<&PropertyDef> {
        self.properties
            .iter()
            .find(|p| names_match(&p.name, document_name))
    }

    pub fn find_relation(&self, document_name: &str) -> Option<&RelationDef> {
        self.relations
            .iter()
            .find(|r| names_match(&r.name, document_name))
    }

    pub fn find_field(&self, document_name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|f| names_match(&f.name, document_name))
    }

    pub fn relation_by_name(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// To-one relation whose foreign key is the given scalar
    pub fn relation_for_foreign_key(&self, foreign_key: &str) -> Option<&RelationDef> {
        self.relations
            .iter()
            .find(|r| r.foreign_key() == Some(foreign_key))
    }
}

/// Schema introspection consumed by the merger and the reconciler.
pub trait MetadataProvider: Send + Sync {
    fn entity_type(&self, name: &str) -> Option<&EntityType>;
}

/// Type-keyed registry of entity metadata, assembled once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeRegistry {
    types: HashMap<String, EntityType>,
    #[serde(default)]
    opaque_types: HashSet<String>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(|k| k.as_str())
    }

    /// Whether a type is deliberately left without metadata
    pub fn is_opaque(&self, name: &str) -> bool {
        self.opaque_types.contains(name)
    }
}

impl MetadataProvider for TypeRegistry {
    fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.types.get(name)
    }
}

#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    types: Vec<EntityType>,
    opaque_types: HashSet<String>,
}

impl TypeRegistryBuilder {
    pub fn with_type(mut self, entity_type: EntityType) -> Self {
        self.types.push(entity_type);
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = EntityType>) -> Self {
        self.types.extend(types);
        self
    }

    /// Register a typed entity through its compile-time description
    pub fn register<E: Entity>(self) -> Self {
        self.with_type(E::describe())
    }

    /// Allow relations to target a type that has no metadata; such nodes are opaque leaves
    pub fn opaque_type(mut self, name: &str) -> Self {
        self.opaque_types.insert(name.to_string());
        self
    }

    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        let mut types = HashMap::with_capacity(self.types.len());
        for entity_type in self.types {
            if types.contains_key(&entity_type.name) {
                return Err(RegistryError::DuplicateType(entity_type.name));
            }
            types.insert(entity_type.name.clone(), entity_type);
        }

        for entity_type in types.values() {
            for relation in &entity_type.relations {
                match types.get(&relation.target) {
                    None if self.opaque_types.contains(&relation.target) => {}
                    None => {
                        return Err(RegistryError::UnknownTarget {
                            entity_type: entity_type.name.clone(),
                            relation: relation.name.clone(),
                            target: relation.target.clone(),
                        })
                    }
                    Some(target) => {
                        if matches!(relation.kind, RelationKind::ManyToMany { .. })
                            && !target.is_junction()
                        {
                            return Err(RegistryError::NotAJunction {
                                entity_type: entity_type.name.clone(),
                                relation: relation.name.clone(),
                                target: relation.target.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(TypeRegistry {
            types,
            opaque_types: self.opaque_types,
        })
    }
}
