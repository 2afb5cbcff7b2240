//! Shared test catalogue: items sold by a wine shop, each pointing at a drink
//! that sits in a subregion → region → country chain and pairs with foods.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::memory::MemoryStore;
use crate::registry::SearchRegistry;
use crate::schema::{DependencyPath, Link, Relation, RelationHop, RootEntity};

fn fk(column: &str) -> Link {
    Link::ForeignKey {
        column: column.into(),
    }
}

fn reference(column: &str) -> Link {
    Link::Reference {
        column: column.into(),
    }
}

fn relation(name: &str, table: &str, link: Link, relations: Vec<Relation>) -> Relation {
    Relation {
        name: name.into(),
        table: table.into(),
        link,
        relations,
    }
}

fn drink_food() -> Link {
    Link::Through {
        table: "drink_food".into(),
        source_column: "food_id".into(),
        target_column: "drink_id".into(),
    }
}

pub(crate) fn item_root() -> RootEntity {
    let country = relation("country", "country", reference("country_id"), vec![]);
    let region = relation("region", "region", reference("region_id"), vec![country]);
    let subregion = relation("subregion", "subregion", reference("subregion_id"), vec![region]);
    let foods = relation(
        "foods",
        "food",
        Link::Through {
            table: "drink_food".into(),
            source_column: "drink_id".into(),
            target_column: "food_id".into(),
        },
        vec![],
    );
    RootEntity::new("item")
        .with_skip_keys(["image_id"])
        .with_document_schema(json!({
            "type": "object",
            "required": ["id", "drink_id"],
            "properties": { "drink_id": { "type": "integer" } }
        }))
        .with_relation(relation(
            "drink",
            "drink",
            reference("drink_id"),
            vec![subregion, foods],
        ))
}

pub(crate) fn registry() -> Arc<SearchRegistry> {
    let to_item = || RelationHop::new("item", fk("drink_id"));
    let to_drink = || RelationHop::new("drink", fk("subregion_id"));
    let to_subregion = || RelationHop::new("subregion", fk("region_id"));

    let registry = SearchRegistry::builder()
        .root(item_root())
        .depends(DependencyPath::new("drink", vec![to_item()]))
        .depends(DependencyPath::new("subregion", vec![to_drink(), to_item()]))
        .depends(DependencyPath::new(
            "region",
            vec![to_subregion(), to_drink(), to_item()],
        ))
        .depends(DependencyPath::new(
            "country",
            vec![
                RelationHop::new("region", fk("country_id")),
                to_subregion(),
                to_drink(),
                to_item(),
            ],
        ))
        .depends(DependencyPath::new(
            "food",
            vec![RelationHop::new("drink", drink_food()), to_item()],
        ))
        .build();
    match registry {
        Ok(registry) => Arc::new(registry),
        Err(e) => panic!("fixture registry: {e}"),
    }
}

fn put(store: &MemoryStore, table: &str, row: Value) {
    store.put_row(table, row).unwrap();
}

/// Items 1 and 4 are Sassicaia, 3 is Ornellaia (both Bolgheri, Italy),
/// 2 is Latour (Pauillac, France). Every item starts with stale content.
pub(crate) fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    put(&store, "country", json!({"id": 1, "name": "Italy"}));
    put(&store, "country", json!({"id": 2, "name": "France"}));
    put(&store, "region", json!({"id": 1, "name": "Tuscany", "country_id": 1}));
    put(&store, "region", json!({"id": 2, "name": "Bordeaux", "country_id": 2}));
    put(&store, "subregion", json!({"id": 1, "name": "Bolgheri", "region_id": 1}));
    put(&store, "subregion", json!({"id": 2, "name": "Pauillac", "region_id": 2}));
    put(&store, "drink", json!({"id": 10, "title": "Sassicaia", "subregion_id": 1}));
    put(&store, "drink", json!({"id": 11, "title": "Latour", "subregion_id": 2}));
    put(&store, "drink", json!({"id": 12, "title": "Ornellaia", "subregion_id": 1}));
    put(&store, "food", json!({"id": 1, "name": "Lamb"}));
    put(&store, "drink_food", json!({"id": 1, "drink_id": 10, "food_id": 1}));
    put(&store, "drink_food", json!({"id": 2, "drink_id": 11, "food_id": 1}));
    for (id, drink_id) in [(1, 10), (2, 11), (3, 12), (4, 10)] {
        put(
            &store,
            "item",
            json!({"id": id, "drink_id": drink_id, "vol": 0.75, "search_content": "stale"}),
        );
    }
    store
}
