use anyhow::Result;
use polyquery_common::config::AppConfig;
use polyquery_core::adapter::{create_adapter, transaction_fn};
use polyquery_core::query::Operator;
use polyquery_core::{CacheLayer, CachedExecutor, PageRequest, Paginator, QueryBuilder, SqlEmitter, Statement};
use serde_json::{json, Value};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // Defaults to an in-memory SQLite database; POLYQUERY__DATABASE__DATABASE overrides it.
    let config = AppConfig::load()?;
    println!("🚀 Engine: {} ({})", config.database.engine, config.database.database);

    // 1. Same query, two dialects
    let query = QueryBuilder::new()
        .select(["id", "name"])
        .from("users")
        .where_("active", true)
        .order_by("created_at", "DESC")
        .limit(10);
    println!("\n📝 SQLite:   {}", query.to_sql(&SqlEmitter::sqlite())?.sql);
    println!("📝 Postgres: {}", query.to_sql(&SqlEmitter::postgres())?.sql);
    println!("📝 Document: {}", serde_json::to_string(&query.to_document()?)?);

    // 2. Connect and create a table
    let adapter = create_adapter(&config.database)?;
    adapter.connect().await?;
    adapter
        .execute(&Statement::raw(
            "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, \
             email TEXT, active INTEGER, created_at TEXT)",
        ))
        .await?;

    let cache = Arc::new(CacheLayer::from_config(config.cache.clone())?);
    let executor = Arc::new(CachedExecutor::new(adapter.clone()).with_cache(cache.clone()));

    // 3. Bulk insert
    let rows: Vec<Value> = (1..=23)
        .map(|i| {
            json!({
                "name": format!("user {:02}", i),
                "email": format!("user{}@example.com", i),
                "active": i % 3 != 0,
                "created_at": format!("2024-01-{:02}", i)
            })
        })
        .collect();
    let inserted = executor.run(&QueryBuilder::table("users").insert_many(rows)).await?;
    println!("\n📥 Inserted {} rows", inserted.affected_count);

    // 4. Cached reads
    let active = QueryBuilder::table("users").where_("active", true).count();
    for _ in 0..2 {
        let n = executor.run(&active).await?.count().unwrap_or(0);
        println!("🔍 Active users: {}", n);
    }
    let stats = cache.stats();
    println!("📊 Cache: {} hits / {} misses", stats.hits, stats.misses);

    // 5. Transaction that rolls back
    let deactivate = QueryBuilder::table("users")
        .set("active", false)
        .where_op("id", Operator::Lte, 5)
        .build_for(adapter.engine())?;
    let outcome = adapter
        .transaction(transaction_fn(move |tx| {
            Box::pin(async move {
                let r = tx.execute(&deactivate).await?;
                Err(polyquery_core::DbError::validation(format!(
                    "refusing to deactivate {} users",
                    r.affected_count
                )))
            })
        }))
        .await;
    println!("\n↩️  Transaction: {:?}", outcome.err().map(|e| e.to_string()));

    // 6. Pagination
    let paginator = Paginator::new(executor.clone(), config.pagination.clone());
    let page = paginator
        .paginate(
            &QueryBuilder::table("users").select(["id", "name", "active"]),
            &PageRequest::new(2, 5).filter("active", true).sort("id", "ASC"),
        )
        .await?;
    println!(
        "\n📄 Page {}/{} ({} records)",
        page.pagination.current_page, page.pagination.total_pages, page.pagination.total_records
    );
    for row in &page.data {
        println!("   - {}", serde_json::to_string(row)?);
    }

    let health = adapter.health_check().await?;
    println!("\n💚 Healthy: {} ({} ms)", health.healthy, health.latency_ms);

    cache.shutdown();
    adapter.disconnect().await?;
    println!("✅ Done.");
    Ok(())
}
