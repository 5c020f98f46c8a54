pub mod sqlite;
pub mod document;
pub mod matcher;
mod pipeline;

pub use sqlite::SqliteAdapter;
pub use document::DocumentAdapter;

use async_trait::async_trait;
use futures::future::BoxFuture;
use polyquery_common::config::ConnectionConfig;
use polyquery_common::{DbError, DbResult, EngineKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::query::{Row, Statement};

/// Engine-independent execution result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub affected_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_id: Option<Value>,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let affected_count = rows.len() as u64;
        Self {
            rows,
            affected_count,
            inserted_id: None,
        }
    }

    pub fn affected(affected_count: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected_count,
            inserted_id: None,
        }
    }

    /// Count queries return a single `{ "count": n }` row on every engine.
    pub fn count(&self) -> Option<u64> {
        self.rows.first()?.get("count")?.as_u64()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub engine: EngineKind,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterStats {
    pub engine: EngineKind,
    pub connected: bool,
    pub queries_executed: u64,
    pub queries_failed: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub total_query_time_ms: u64,
    /// Engine-specific figures (page counts, key estimates, ...).
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaInfo {
    pub engine: EngineKind,
    pub collections: Vec<CollectionSchema>,
}

impl SchemaInfo {
    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.iter().find(|c| c.name == name)
    }
}

/// Execution handle scoped to one open transaction.
#[async_trait]
pub trait TransactionHandle: Send {
    async fn execute(&mut self, statement: &Statement) -> DbResult<QueryResult>;
}

/// Unit of work passed to [`DatabaseAdapter::transaction`].
pub type TransactionFn = Box<
    dyn for<'t> FnOnce(&'t mut dyn TransactionHandle) -> BoxFuture<'t, DbResult<Value>> + Send,
>;

/// Box a closure as a [`TransactionFn`], letting the compiler infer the
/// higher-ranked signature:
///
/// ```ignore
/// adapter.transaction(transaction_fn(move |tx| Box::pin(async move {
///     tx.execute(&debit).await?;
///     tx.execute(&credit).await?;
///     Ok(Value::Null)
/// }))).await?;
/// ```
pub fn transaction_fn<F>(f: F) -> TransactionFn
where
    F: for<'t> FnOnce(&'t mut dyn TransactionHandle) -> BoxFuture<'t, DbResult<Value>> + Send + 'static,
{
    Box::new(f)
}

/// Capability set every engine binding implements.
///
/// Every method except `engine()` fails with `NotImplemented` unless the
/// binding overrides it; there is no silent fallback.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn engine(&self) -> EngineKind;

    async fn connect(&self) -> DbResult<()> {
        Err(DbError::not_implemented("connect", self.engine()))
    }

    async fn disconnect(&self) -> DbResult<()> {
        Err(DbError::not_implemented("disconnect", self.engine()))
    }

    async fn execute(&self, _statement: &Statement) -> DbResult<QueryResult> {
        Err(DbError::not_implemented("execute", self.engine()))
    }

    async fn health_check(&self) -> DbResult<HealthStatus> {
        Err(DbError::not_implemented("health_check", self.engine()))
    }

    /// Run `work` inside one unit of work: commit on `Ok`, roll back and
    /// return the original error on `Err`.
    async fn transaction(&self, _work: TransactionFn) -> DbResult<Value> {
        Err(DbError::not_implemented("transaction", self.engine()))
    }

    async fn get_statistics(&self) -> DbResult<AdapterStats> {
        Err(DbError::not_implemented("get_statistics", self.engine()))
    }

    async fn get_schema(&self) -> DbResult<SchemaInfo> {
        Err(DbError::not_implemented("get_schema", self.engine()))
    }
}

/// Pick the binding for `config.engine`. The adapter is returned unconnected.
pub fn create_adapter(config: &ConnectionConfig) -> DbResult<Arc<dyn DatabaseAdapter>> {
    match config.engine {
        EngineKind::Sqlite => Ok(Arc::new(SqliteAdapter::new(config.clone()))),
        EngineKind::Document => Ok(Arc::new(DocumentAdapter::new(config.clone()))),
        other => Err(DbError::Config(format!(
            "no adapter binding is bundled for engine '{}'; SQL for it can still be emitted with SqlEmitter::for_engine",
            other
        ))),
    }
}

/// Counters shared by the bundled bindings.
#[derive(Debug, Default)]
pub(crate) struct AdapterMetrics {
    queries_executed: AtomicU64,
    queries_failed: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    total_query_time_ms: AtomicU64,
}

impl AdapterMetrics {
    pub(crate) fn record_query<T, E>(&self, started: Instant, result: &Result<T, E>) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_query_time_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, engine: EngineKind, connected: bool, details: Value) -> AdapterStats {
        AdapterStats {
            engine,
            connected,
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            total_query_time_ms: self.total_query_time_ms.load(Ordering::Relaxed),
            details,
        }
    }
}
