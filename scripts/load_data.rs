//! Load data script for jsondrop
//!
//! Opens the store directly (no server), creates a database with a `users`
//! collection, inserts sample documents and runs a filtered query.
//! Run: cargo run --bin load_data
//! Then point jsondrop-cli at the printed database id and keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use jsondrop::events::Broadcaster;
use jsondrop::validation::Filters;
use jsondrop::{Catalog, DocumentStore};
use serde_json::json;

const DATA_DIR: &str = "./data";
const CATALOG_PATH: &str = "./data/catalog.db";
const QUOTA_BYTES: u64 = 100 * 1024 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let catalog = Arc::new(Catalog::open(
        CATALOG_PATH,
        DATA_DIR,
        QUOTA_BYTES,
        Broadcaster::default(),
    )?);
    let store = DocumentStore::new(catalog.clone());

    let created = catalog.create_tenant()?;
    let db = created.database_id.as_str();

    let fields: BTreeMap<String, String> = [
        ("name", "string"),
        ("email", "string"),
        ("age", "number"),
        ("status", "string"),
        ("verified", "bool"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    catalog.create_schema(db, "users", &fields)?;

    let statuses = ["active", "pending", "archived"];
    for i in 0..9 {
        let data = json!({
            "name": format!("User {}", i),
            "email": format!("user{}@example.com", i),
            "age": 20 + i,
            "status": statuses[i % statuses.len()],
            "verified": i % 2 == 0,
        });
        let Some(data) = data.as_object().cloned() else {
            continue;
        };
        store.insert(db, "users", data)?;
    }
    println!("✅ Loaded 9 documents into {}/users", db);

    let mut filters = Filters::new();
    filters.insert("status".to_string(), vec!["active".to_string(), "pending".to_string()]);
    let found = store.query(db, "users", 0, 0, &filters)?;
    println!("✅ status in (active, pending): {} documents, newest first", found.len());
    for doc in &found {
        println!("   {} {}", doc.id, doc.data["name"]);
    }

    let info = catalog.info(db)?;
    println!(
        "✅ Quota: {} / {} bytes ({:.4}%)",
        info.quota_used, info.quota_limit, info.quota_percent
    );

    println!();
    println!("database_id: {}", created.database_id);
    println!("write_key:   {}", created.write_key);
    println!("read_key:    {}", created.read_key);

    Ok(())
}
