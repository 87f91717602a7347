use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::EntityType;

/// Compile-time description of a typed entity.
///
/// Implementors register themselves with
/// [`TypeRegistryBuilder::register`](crate::model::TypeRegistryBuilder::register)
/// and can be pulled out of a graph with
/// [`EntityGraph::extract`](crate::model::EntityGraph::extract).
pub trait Entity: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;

    fn describe() -> EntityType;
}
