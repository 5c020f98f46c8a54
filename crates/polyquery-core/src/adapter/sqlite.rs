use async_trait::async_trait;
use polyquery_common::config::ConnectionConfig;
use polyquery_common::{DbError, DbResult, EngineError, EngineKind};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{
    AdapterMetrics, AdapterStats, CollectionSchema, DatabaseAdapter, FieldSchema, HealthStatus,
    QueryResult, SchemaInfo, TransactionFn, TransactionHandle,
};
use crate::query::{Operation, Row, SqlStatement, Statement};

/// Embedded SQLite binding.
///
/// One connection guarded by an async mutex; a transaction holds the lock
/// for its whole unit of work, so statements inside it must go through the
/// handle rather than back through the adapter.
pub struct SqliteAdapter {
    config: ConnectionConfig,
    conn: Mutex<Option<Connection>>,
    metrics: AdapterMetrics,
}

impl SqliteAdapter {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            metrics: AdapterMetrics::default(),
        }
    }

    pub fn memory() -> Self {
        Self::new(ConnectionConfig::sqlite_memory())
    }

    fn open_connection(&self) -> rusqlite::Result<Connection> {
        let path = self
            .config
            .database
            .strip_prefix("sqlite://")
            .unwrap_or(&self.config.database);

        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        conn.busy_timeout(Duration::from_millis(self.config.statement_timeout_ms))?;
        if self.config.flag("foreign_keys", true) {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        if self.config.flag("wal", false) {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        Ok(conn)
    }
}

fn engine_error(operation: &str, e: rusqlite::Error) -> DbError {
    let mut err = EngineError::new(EngineKind::Sqlite, operation, e.to_string());
    if let Some(code) = e.sqlite_error_code() {
        err = err.with_code(format!("{:?}", code));
    }
    DbError::Engine(err)
}

fn not_connected(operation: &str) -> DbError {
    DbError::Engine(
        EngineError::new(EngineKind::Sqlite, operation, "not connected").with_code("NOT_CONNECTED"),
    )
}

fn expect_sql<'a>(statement: &'a Statement) -> DbResult<&'a SqlStatement> {
    match statement {
        Statement::Sql(s) => Ok(s),
        Statement::Document(d) => Err(DbError::validation_for(
            "document operations cannot run on a SQL engine",
            d.method.as_str(),
            Some(&d.target),
        )),
    }
}

fn to_sql_value(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Nested values are stored as JSON text.
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_value_ref(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| json!(byte)).collect()),
    }
}

fn query_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Vec<Row>> {
    let mut prepared = conn.prepare(sql)?;
    let names: Vec<String> = prepared.column_names().into_iter().map(String::from).collect();
    let mut rows = prepared.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (i, name) in names.iter().enumerate() {
            map.insert(name.clone(), from_value_ref(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn run_sql(conn: &Connection, stmt: &SqlStatement) -> rusqlite::Result<QueryResult> {
    let params: Vec<SqlValue> = stmt.params.iter().map(to_sql_value).collect();

    if stmt.operation == Operation::Raw {
        // Raw text may be DDL or a row-returning pragma; the prepared statement knows which.
        let mut prepared = conn.prepare(&stmt.sql)?;
        if prepared.column_count() == 0 {
            let affected = prepared.execute(params_from_iter(params.iter()))?;
            return Ok(QueryResult::affected(affected as u64));
        }
        drop(prepared);
        return Ok(QueryResult::from_rows(query_rows(conn, &stmt.sql, &params)?));
    }

    if stmt.operation.is_read() {
        return Ok(QueryResult::from_rows(query_rows(conn, &stmt.sql, &params)?));
    }

    let affected = conn.execute(&stmt.sql, params_from_iter(params.iter()))?;
    let mut result = QueryResult::affected(affected as u64);
    if stmt.operation == Operation::Insert && affected > 0 {
        result.inserted_id = Some(json!(conn.last_insert_rowid()));
    }
    Ok(result)
}

fn table_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let rows = query_rows(
        conn,
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        &[],
    )?;
    Ok(rows
        .into_iter()
        .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
        .collect())
}

fn describe_table(conn: &Connection, table: &str) -> rusqlite::Result<CollectionSchema> {
    let quoted = table.replace('"', "\"\"");
    let columns = query_rows(conn, &format!("PRAGMA table_info(\"{}\")", quoted), &[])?;
    let fields = columns
        .iter()
        .map(|c| {
            let primary_key = c.get("pk").and_then(Value::as_i64).unwrap_or(0) > 0;
            FieldSchema {
                name: c.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                data_type: c.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
                nullable: c.get("notnull").and_then(Value::as_i64).unwrap_or(0) == 0 && !primary_key,
                primary_key,
            }
        })
        .collect();

    let count = query_rows(conn, &format!("SELECT COUNT(*) AS count FROM \"{}\"", quoted), &[])?;
    let row_count = count.first().and_then(|r| r.get("count")).and_then(Value::as_u64);

    Ok(CollectionSchema {
        name: table.to_string(),
        fields,
        row_count,
    })
}

fn pragma_int(conn: &Connection, name: &str) -> Option<i64> {
    conn.query_row(&format!("PRAGMA {}", name), [], |row| row.get::<_, i64>(0)).ok()
}

struct SqliteTransaction<'c> {
    conn: &'c mut Connection,
    metrics: &'c AdapterMetrics,
}

#[async_trait]
impl<'c> TransactionHandle for SqliteTransaction<'c> {
    async fn execute(&mut self, statement: &Statement) -> DbResult<QueryResult> {
        let stmt = expect_sql(statement)?;
        let started = Instant::now();
        let result = run_sql(&*self.conn, stmt).map_err(|e| engine_error("execute", e));
        self.metrics.record_query(started, &result);
        result
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn connect(&self) -> DbResult<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let conn = self.open_connection().map_err(|e| engine_error("connect", e))?;
        *guard = Some(conn);
        tracing::info!("Connected to SQLite database {}", self.config.database);
        Ok(())
    }

    async fn disconnect(&self) -> DbResult<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err((conn, e)) = conn.close() {
                *guard = Some(conn);
                return Err(engine_error("disconnect", e));
            }
            tracing::info!("Disconnected from SQLite database {}", self.config.database);
        }
        Ok(())
    }

    async fn execute(&self, statement: &Statement) -> DbResult<QueryResult> {
        let stmt = expect_sql(statement)?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| not_connected("execute"))?;

        let started = Instant::now();
        let result = run_sql(conn, stmt).map_err(|e| engine_error("execute", e));
        self.metrics.record_query(started, &result);

        match &result {
            Ok(r) => tracing::debug!(
                "{} on {} ok: {} rows, {} affected",
                stmt.operation,
                stmt.target,
                r.rows.len(),
                r.affected_count
            ),
            Err(e) => tracing::warn!("SQLite {} on {} failed: {}", stmt.operation, stmt.target, e),
        }
        result
    }

    async fn health_check(&self) -> DbResult<HealthStatus> {
        let guard = self.conn.lock().await;
        let started = Instant::now();
        let (healthy, message) = match guard.as_ref() {
            None => (false, Some("not connected".to_string())),
            Some(conn) => match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
                Ok(_) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            },
        };
        Ok(HealthStatus {
            healthy,
            engine: EngineKind::Sqlite,
            latency_ms: started.elapsed().as_millis() as u64,
            message,
        })
    }

    async fn transaction(&self, work: TransactionFn) -> DbResult<Value> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| not_connected("transaction"))?;

        conn.execute_batch("BEGIN")
            .map_err(|e| DbError::Transaction { message: format!("begin failed: {}", e) })?;

        let mut handle = SqliteTransaction {
            conn: &mut *conn,
            metrics: &self.metrics,
        };
        let outcome = work(&mut handle).await;

        match outcome {
            Ok(value) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    if let Err(rb) = conn.execute_batch("ROLLBACK") {
                        tracing::error!("Rollback after failed commit also failed: {}", rb);
                    }
                    self.metrics.record_rollback();
                    return Err(DbError::Transaction { message: format!("commit failed: {}", e) });
                }
                self.metrics.record_commit();
                tracing::debug!("SQLite transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = conn.execute_batch("ROLLBACK") {
                    tracing::error!("Rollback failed: {}", rb);
                }
                self.metrics.record_rollback();
                tracing::debug!("SQLite transaction rolled back: {}", err);
                Err(err)
            }
        }
    }

    async fn get_statistics(&self) -> DbResult<AdapterStats> {
        let guard = self.conn.lock().await;
        let details = match guard.as_ref() {
            Some(conn) => json!({
                "database": self.config.database,
                "page_count": pragma_int(conn, "page_count"),
                "page_size": pragma_int(conn, "page_size"),
                "freelist_count": pragma_int(conn, "freelist_count"),
            }),
            None => json!({ "database": self.config.database }),
        };
        Ok(self.metrics.snapshot(EngineKind::Sqlite, guard.is_some(), details))
    }

    async fn get_schema(&self) -> DbResult<SchemaInfo> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| not_connected("get_schema"))?;

        let mut collections = Vec::new();
        for table in table_names(conn).map_err(|e| engine_error("get_schema", e))? {
            collections.push(describe_table(conn, &table).map_err(|e| engine_error("get_schema", e))?);
        }
        Ok(SchemaInfo {
            engine: EngineKind::Sqlite,
            collections,
        })
    }
}
