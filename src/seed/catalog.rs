use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::model::{Entity, EntityType, RelationKind, ScalarType, TypeRegistry};

fn to_one(foreign_key: &str) -> RelationKind {
    RelationKind::ToOne {
        foreign_key: Some(foreign_key.to_string()),
    }
}

fn to_many(inverse_foreign_key: &str) -> RelationKind {
    RelationKind::ToMany {
        inverse_foreign_key: Some(inverse_foreign_key.to_string()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

impl Entity for Group {
    const TYPE_NAME: &'static str = "Group";

    fn describe() -> EntityType {
        EntityType::new(Self::TYPE_NAME).property("name", ScalarType::String)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: i64,
    pub name: String,
}

impl Entity for User {
    const TYPE_NAME: &'static str = "User";

    fn describe() -> EntityType {
        EntityType::new(Self::TYPE_NAME).property("name", ScalarType::String)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tag {
    pub id: i64,
    pub label: String,
}

impl Entity for Tag {
    const TYPE_NAME: &'static str = "Tag";

    fn describe() -> EntityType {
        EntityType::new(Self::TYPE_NAME).property("label", ScalarType::String)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Asset {
    pub id: i64,
    pub url: String,
}

impl Entity for Asset {
    const TYPE_NAME: &'static str = "Asset";

    fn describe() -> EntityType {
        EntityType::new(Self::TYPE_NAME).property("url", ScalarType::String)
    }
}

/// A set of items worn together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Outfit {
    pub id: i64,
    pub name: String,
    pub items: Vec<Item>,
}

impl Entity for Outfit {
    const TYPE_NAME: &'static str = "Outfit";

    fn describe() -> EntityType {
        EntityType::new(Self::TYPE_NAME)
            .property("name", ScalarType::String)
            .relation("items", Item::TYPE_NAME, to_many("outfit_id"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Item {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
    pub outfit_id: Option<i64>,
    pub group_id: i64,
    pub uploader_user_id: i64,
    pub released_at: Option<DateTime<Utc>>,
    /// Computed by the API layer, never stored
    pub preview_url: Option<String>,
    pub parts: Vec<ItemPart>,
    pub tags: Vec<ItemTag>,
    pub thumbnail: Option<Box<ItemThumbnail>>,
    pub outfit: Option<Box<Outfit>>,
    pub group: Option<Group>,
    pub uploader: Option<User>,
}

impl Entity for Item {
    const TYPE_NAME: &'static str = "Item";

    fn describe() -> EntityType {
        EntityType::new(Self::TYPE_NAME)
            .property("name", ScalarType::String)
            .nullable_property("color", ScalarType::String)
            .nullable_property("outfit_id", ScalarType::Integer)
            .property("group_id", ScalarType::Integer)
            .property("uploader_user_id", ScalarType::Integer)
            .nullable_property("released_at", ScalarType::Timestamp)
            .view_field("preview_url", ScalarType::String)
            .relation("parts", ItemPart::TYPE_NAME, to_many("item_id"))
            .relation(
                "tags",
                ItemTag::TYPE_NAME,
                RelationKind::ManyToMany { collection: true },
            )
            .relation(
                "thumbnail",
                ItemThumbnail::TYPE_NAME,
                RelationKind::ManyToMany { collection: false },
            )
            .relation("outfit", Outfit::TYPE_NAME, to_one("outfit_id"))
            .relation("group", Group::TYPE_NAME, to_one("group_id"))
            .relation("uploader", User::TYPE_NAME, to_one("uploader_user_id"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemPart {
    pub id: i64,
    pub path: String,
    pub item_id: Option<i64>,
    pub item: Option<Box<Item>>,
}

impl Entity for ItemPart {
    const TYPE_NAME: &'static str = "ItemPart";

    fn describe() -> EntityType {
        EntityType::new(Self::TYPE_NAME)
            .property("path", ScalarType::String)
            .nullable_property("item_id", ScalarType::Integer)
            .relation("item", Item::TYPE_NAME, to_one("item_id"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemTag {
    pub item_id: i64,
    pub tag_id: i64,
    pub tag: Option<Tag>,
}

impl Entity for ItemTag {
    const TYPE_NAME: &'static str = "ItemTag";

    fn describe() -> EntityType {
        EntityType::junction(Self::TYPE_NAME, "item_id", "tag_id")
            .relation("tag", Tag::TYPE_NAME, to_one("tag_id"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemThumbnail {
    pub item_id: i64,
    pub asset_id: i64,
    pub asset: Option<Asset>,
}

impl Entity for ItemThumbnail {
    const TYPE_NAME: &'static str = "ItemThumbnail";

    fn describe() -> EntityType {
        EntityType::junction(Self::TYPE_NAME, "item_id", "asset_id")
            .relation("asset", Asset::TYPE_NAME, to_one("asset_id"))
    }
}

/// Registry of the demo catalog types
pub fn catalog_registry() -> Result<TypeRegistry, RegistryError> {
    TypeRegistry::builder()
        .register::<Group>()
        .register::<User>()
        .register::<Tag>()
        .register::<Asset>()
        .register::<Outfit>()
        .register::<Item>()
        .register::<ItemPart>()
        .register::<ItemTag>()
        .register::<ItemThumbnail>()
        .build()
}
