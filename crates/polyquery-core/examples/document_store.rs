use anyhow::Result;
use polyquery_common::config::ConnectionConfig;
use polyquery_core::adapter::DocumentAdapter;
use polyquery_core::{DatabaseAdapter, EngineKind, QueryBuilder};
use serde_json::json;
use std::fs;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let data_dir = PathBuf::from("./data_example_documents");
    if data_dir.exists() {
        fs::remove_dir_all(&data_dir)?;
    }
    fs::create_dir_all(&data_dir)?;

    let store = DocumentAdapter::new(ConnectionConfig::document(data_dir.to_string_lossy()));
    store.connect().await?;

    let engine = EngineKind::Document;
    store
        .execute(&QueryBuilder::table("customers").insert_many(vec![
            json!({ "_id": "c1", "name": "Ada", "tier": "gold" }),
            json!({ "_id": "c2", "name": "Linus", "tier": "silver" }),
        ]).build_for(engine)?)
        .await?;
    store
        .execute(&QueryBuilder::table("orders").insert_many(vec![
            json!({ "customer": "c1", "total": 120, "items": ["keyboard", "mouse"] }),
            json!({ "customer": "c1", "total": 80, "items": ["monitor"] }),
            json!({ "customer": "c2", "total": 45, "items": ["cable"] }),
        ]).build_for(engine)?)
        .await?;

    // Joins are relational-only; on a document target they are ignored with a warning.
    let ignored = QueryBuilder::table("orders")
        .join("customers", "orders.customer", "customers._id")
        .where_op("total", polyquery_core::query::Operator::Gt, 50)
        .build_for(engine)?;
    println!("🔍 Orders over 50: {}", store.execute(&ignored).await?.rows.len());

    // The same join expressed as a pipeline.
    let report = QueryBuilder::table("orders")
        .group_stage(json!({ "_id": "$customer", "spent": { "$sum": "$total" }, "orders": { "$sum": 1 } }))
        .lookup_stage("customers", "_id", "_id", "customer")
        .unwind_stage("customer")
        .sort_stage(json!({ "spent": -1 }))
        .project_stage(json!({ "_id": 0, "name": "$customer.name", "spent": 1, "orders": 1 }));
    println!("\n📊 Spend per customer:");
    for row in store.execute(&report.build_for(engine)?).await?.rows {
        println!("   - {}", serde_json::to_string(&row)?);
    }

    let schema = store.get_schema().await?;
    for collection in &schema.collections {
        let fields: Vec<String> = collection
            .fields
            .iter()
            .map(|f| format!("{}:{}", f.name, f.data_type))
            .collect();
        println!("\n🗂  {} ({:?} docs): {}", collection.name, collection.row_count, fields.join(", "));
    }

    store.disconnect().await?;
    println!("✅ Done.");
    Ok(())
}
