use anyhow::Result;
use log::info;
use serde_json::json;

use crate::store::MemoryStore;

/// Load the demo catalog rows into `store`.
///
/// Outfit 42 owns items 3 and 4. Item 3 has one part (30), tags 10 and 11
/// and thumbnail asset 20. Tag 12 and asset 21 exist but are unlinked.
pub fn seed_store(store: &MemoryStore) -> Result<()> {
    let rows = [
        ("Group", json!({"id": 1, "name": "Studio"})),
        ("User", json!({"id": 7, "name": "ada"})),
        ("Tag", json!({"id": 10, "label": "wool"})),
        ("Tag", json!({"id": 11, "label": "winter"})),
        ("Tag", json!({"id": 12, "label": "sale"})),
        ("Asset", json!({"id": 20, "url": "https://cdn.example/beanie.png"})),
        ("Asset", json!({"id": 21, "url": "https://cdn.example/beanie-alt.png"})),
        ("Outfit", json!({"id": 42, "name": "Winter set"})),
        (
            "Item",
            json!({
                "id": 3,
                "name": "Beanie",
                "color": "grey",
                "outfit_id": 42,
                "group_id": 1,
                "uploader_user_id": 7,
                "released_at": "2023-11-20T09:00:00+00:00"
            }),
        ),
        (
            "Item",
            json!({
                "id": 4,
                "name": "Sock",
                "color": null,
                "outfit_id": 42,
                "group_id": 1,
                "uploader_user_id": 7,
                "released_at": null
            }),
        ),
        ("ItemPart", json!({"id": 30, "path": "beanie/top.png", "item_id": 3})),
        ("ItemTag", json!({"item_id": 3, "tag_id": 10})),
        ("ItemTag", json!({"item_id": 3, "tag_id": 11})),
        ("ItemThumbnail", json!({"item_id": 3, "asset_id": 20})),
    ];

    let count = rows.len();
    for (entity_type, row) in rows {
        store.seed(entity_type, row)?;
    }
    info!("seeded {} catalog rows", count);
    Ok(())
}
