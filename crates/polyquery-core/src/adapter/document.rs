use async_trait::async_trait;
use polyquery_common::config::ConnectionConfig;
use polyquery_common::{DbError, DbResult, EngineError, EngineKind};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::matcher::{matches, sort_documents};
use super::pipeline::{apply_update, project, run_pipeline};
use super::{
    AdapterMetrics, AdapterStats, CollectionSchema, DatabaseAdapter, FieldSchema, HealthStatus,
    QueryResult, SchemaInfo, TransactionFn, TransactionHandle,
};
use crate::query::{DocumentMethod, DocumentOperation, Row, Statement};
use crate::storage::{KvStore, KvWrite};

const SCHEMA_SAMPLE_SIZE: usize = 100;

fn doc_prefix(collection: &str) -> Vec<u8> {
    format!("doc:{}:", collection).into_bytes()
}

/// The `_id` keeps its JSON type in the key, so `"1"` and `1` are different documents.
fn doc_key(collection: &str, id: &Value) -> Vec<u8> {
    let id = match id {
        Value::String(s) => format!("s:{}", s),
        Value::Number(n) => format!("n:{}", n),
        other => format!("j:{}", other),
    };
    format!("doc:{}:{}", collection, id).into_bytes()
}

fn collection_key(collection: &str) -> Vec<u8> {
    format!("meta:collection:{}", collection).into_bytes()
}

fn storage_error(operation: &str, e: anyhow::Error) -> DbError {
    let mut err = EngineError::new(EngineKind::Document, operation, e.to_string());
    if let Some(rocks) = e.downcast_ref::<rocksdb::Error>() {
        err = err.with_code(format!("{:?}", rocks.kind()));
    }
    DbError::Engine(err)
}

fn corrupt(operation: &str, e: serde_json::Error) -> DbError {
    DbError::Engine(
        EngineError::new(EngineKind::Document, operation, format!("stored document is not valid JSON: {}", e))
            .with_code("CORRUPT_DOCUMENT"),
    )
}

fn validate_collection(name: &str) -> DbResult<()> {
    if name.is_empty() || name.contains(':') || name.starts_with('$') {
        return Err(DbError::validation(format!("invalid collection name: {:?}", name)));
    }
    Ok(())
}

fn expect_document(statement: &Statement) -> DbResult<&DocumentOperation> {
    match statement {
        Statement::Document(d) => Ok(d),
        Statement::Sql(s) => Err(DbError::validation_for(
            "SQL statements cannot run on the document engine",
            s.operation.as_str(),
            Some(&s.target),
        )),
    }
}

/// Reads see committed state plus this session's staged writes; writes
/// stay staged until `commit`.
struct Session<'s> {
    store: &'s KvStore,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'s> Session<'s> {
    fn new(store: &'s KvStore) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
        }
    }

    fn load(&self, collection: &str) -> DbResult<Vec<Row>> {
        let prefix = doc_prefix(collection);
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .store
            .scan(&prefix)
            .map_err(|e| storage_error("find", e))?
            .into_iter()
            .collect();
        for (k, v) in self.pending.range(prefix.clone()..) {
            if !k.starts_with(&prefix) {
                break;
            }
            match v {
                Some(bytes) => merged.insert(k.clone(), bytes.clone()),
                None => merged.remove(k),
            };
        }
        merged
            .values()
            .map(|bytes| serde_json::from_slice::<Row>(bytes).map_err(|e| corrupt("find", e)))
            .collect()
    }

    fn checkpoint(&self) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        self.pending.clone()
    }

    fn restore(&mut self, checkpoint: BTreeMap<Vec<u8>, Option<Vec<u8>>>) {
        self.pending = checkpoint;
    }

    fn exists(&self, key: &[u8]) -> DbResult<bool> {
        if let Some(staged) = self.pending.get(key) {
            return Ok(staged.is_some());
        }
        Ok(self.store.get(key).map_err(|e| storage_error("get", e))?.is_some())
    }

    fn put(&mut self, collection: &str, doc: &Row) -> DbResult<()> {
        let id = doc.get("_id").cloned().unwrap_or(Value::Null);
        self.pending.insert(doc_key(collection, &id), Some(serde_json::to_vec(doc)?));
        self.pending.insert(collection_key(collection), Some(b"{}".to_vec()));
        Ok(())
    }

    fn remove(&mut self, collection: &str, doc: &Row) {
        let id = doc.get("_id").cloned().unwrap_or(Value::Null);
        self.pending.insert(doc_key(collection, &id), None);
    }

    fn commit(self) -> DbResult<usize> {
        let writes: Vec<KvWrite> = self.pending.into_iter().collect();
        let n = writes.len();
        self.store.write_batch(writes).map_err(|e| storage_error("commit", e))?;
        Ok(n)
    }
}

fn run_operation(session: &mut Session<'_>, op: &DocumentOperation) -> DbResult<QueryResult> {
    validate_collection(&op.target)?;
    match op.method {
        DocumentMethod::Find => {
            let mut docs = Vec::new();
            for doc in session.load(&op.target)? {
                if matches(&doc, &op.filter)? {
                    docs.push(doc);
                }
            }
            if let Some(sort) = &op.sort {
                sort_documents(&mut docs, sort);
            }
            let skip = op.skip.unwrap_or(0) as usize;
            let mut docs: Vec<Row> = docs.into_iter().skip(skip).collect();
            if let Some(limit) = op.limit {
                docs.truncate(limit as usize);
            }
            if let Some(spec) = &op.projection {
                docs = docs.iter().map(|d| project(d, spec)).collect::<DbResult<_>>()?;
            }
            Ok(QueryResult::from_rows(docs))
        }
        DocumentMethod::CountDocuments => {
            let mut n = 0u64;
            for doc in session.load(&op.target)? {
                if matches(&doc, &op.filter)? {
                    n += 1;
                }
            }
            let mut row = Row::new();
            row.insert("count".to_string(), json!(n));
            Ok(QueryResult::from_rows(vec![row]))
        }
        DocumentMethod::InsertMany => {
            let docs = op
                .documents
                .as_ref()
                .filter(|d| !d.is_empty())
                .ok_or_else(|| DbError::validation_for("no data to insert", "insertMany", Some(&op.target)))?;
            let mut ids = Vec::with_capacity(docs.len());
            for doc in docs {
                let mut doc = doc.clone();
                let id = doc
                    .entry("_id".to_string())
                    .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
                    .clone();
                if session.exists(&doc_key(&op.target, &id))? {
                    return Err(DbError::Engine(
                        EngineError::new(
                            EngineKind::Document,
                            "insertMany",
                            format!("duplicate _id {} in {}", id, op.target),
                        )
                        .with_code("DUPLICATE_KEY"),
                    ));
                }
                session.put(&op.target, &doc)?;
                ids.push(id);
            }
            let mut result = QueryResult::affected(ids.len() as u64);
            result.inserted_id = Some(if ids.len() == 1 { ids.remove(0) } else { Value::Array(ids) });
            Ok(result)
        }
        DocumentMethod::UpdateMany => {
            let update = op
                .update
                .as_ref()
                .ok_or_else(|| DbError::validation_for("no data to update", "updateMany", Some(&op.target)))?;
            let mut n = 0u64;
            for mut doc in session.load(&op.target)? {
                if matches(&doc, &op.filter)? {
                    apply_update(&mut doc, update)?;
                    session.put(&op.target, &doc)?;
                    n += 1;
                }
            }
            Ok(QueryResult::affected(n))
        }
        DocumentMethod::DeleteMany => {
            let mut n = 0u64;
            for doc in session.load(&op.target)? {
                if matches(&doc, &op.filter)? {
                    session.remove(&op.target, &doc);
                    n += 1;
                }
            }
            Ok(QueryResult::affected(n))
        }
        DocumentMethod::Aggregate => {
            let stages = op.pipeline.as_deref().unwrap_or_default();
            let docs = session.load(&op.target)?;
            let reader: &Session<'_> = session;
            let rows = run_pipeline(docs, stages, |from| {
                validate_collection(from)?;
                reader.load(from)
            })?;
            Ok(QueryResult::from_rows(rows))
        }
    }
}

/// Embedded document store over RocksDB.
///
/// Documents live under `doc:<collection>:<_id>` as JSON. Every write
/// operation stages its changes and commits them in one batch, so a failed
/// `updateMany` leaves nothing half-applied. Writers are serialized.
pub struct DocumentAdapter {
    config: ConnectionConfig,
    store: RwLock<Option<KvStore>>,
    write_lock: Mutex<()>,
    metrics: AdapterMetrics,
}

impl DocumentAdapter {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            store: RwLock::new(None),
            write_lock: Mutex::new(()),
            metrics: AdapterMetrics::default(),
        }
    }

    async fn store(&self, operation: &str) -> DbResult<KvStore> {
        self.store.read().await.clone().ok_or_else(|| {
            DbError::Engine(
                EngineError::new(EngineKind::Document, operation, "not connected").with_code("NOT_CONNECTED"),
            )
        })
    }

    fn collections(store: &KvStore) -> DbResult<Vec<String>> {
        let prefix = b"meta:collection:";
        Ok(store
            .scan(prefix)
            .map_err(|e| storage_error("get_schema", e))?
            .into_iter()
            .filter_map(|(k, _)| String::from_utf8(k[prefix.len()..].to_vec()).ok())
            .collect())
    }
}

struct DocumentTransaction<'s> {
    session: Session<'s>,
    metrics: &'s AdapterMetrics,
}

#[async_trait]
impl<'s> TransactionHandle for DocumentTransaction<'s> {
    async fn execute(&mut self, statement: &Statement) -> DbResult<QueryResult> {
        let op = expect_document(statement)?;
        let started = Instant::now();
        // A failed statement leaves no staged writes behind, even if the caller recovers.
        let checkpoint = self.session.checkpoint();
        let result = run_operation(&mut self.session, op);
        if result.is_err() {
            self.session.restore(checkpoint);
        }
        self.metrics.record_query(started, &result);
        result
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Field types inferred from the first documents of a collection.
fn infer_schema(name: &str, sample: &[Row], row_count: u64) -> CollectionSchema {
    let mut seen: BTreeMap<String, (BTreeSet<&'static str>, usize)> = BTreeMap::new();
    for doc in sample {
        for (field, value) in doc {
            let entry = seen.entry(field.clone()).or_default();
            entry.0.insert(json_type(value));
            entry.1 += 1;
        }
    }
    let fields = seen
        .into_iter()
        .map(|(field, (types, present))| {
            let nullable = present < sample.len() || types.contains("null");
            let concrete: Vec<&str> = types.into_iter().filter(|t| *t != "null").collect();
            FieldSchema {
                primary_key: field == "_id",
                name: field,
                data_type: if concrete.is_empty() { "null".to_string() } else { concrete.join("|") },
                nullable,
            }
        })
        .collect();
    CollectionSchema {
        name: name.to_string(),
        fields,
        row_count: Some(row_count),
    }
}

#[async_trait]
impl DatabaseAdapter for DocumentAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Document
    }

    async fn connect(&self) -> DbResult<()> {
        let mut guard = self.store.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let path = self.config.database.clone();
        if path.is_empty() || path == ":memory:" {
            return Err(DbError::Config(
                "document engine needs a data directory in database".to_string(),
            ));
        }
        let kv = tokio::task::spawn_blocking(move || KvStore::open(path))
            .await
            .map_err(|e| storage_error("connect", e.into()))?
            .map_err(|e| storage_error("connect", e))?;
        *guard = Some(kv);
        tracing::info!("Opened document store at {}", self.config.database);
        Ok(())
    }

    async fn disconnect(&self) -> DbResult<()> {
        let _writer = self.write_lock.lock().await;
        if let Some(kv) = self.store.write().await.take() {
            kv.flush().map_err(|e| storage_error("disconnect", e))?;
            tracing::info!("Closed document store at {}", self.config.database);
        }
        Ok(())
    }

    async fn execute(&self, statement: &Statement) -> DbResult<QueryResult> {
        let op = expect_document(statement)?;
        let store = self.store("execute").await?;
        let started = Instant::now();

        let result = if op.method.is_read() {
            run_operation(&mut Session::new(&store), op)
        } else {
            let _writer = self.write_lock.lock().await;
            let mut session = Session::new(&store);
            run_operation(&mut session, op).and_then(|r| {
                session.commit()?;
                Ok(r)
            })
        };
        self.metrics.record_query(started, &result);

        match &result {
            Ok(r) => tracing::debug!(
                "{} on {} ok: {} docs, {} affected",
                op.method.as_str(),
                op.target,
                r.rows.len(),
                r.affected_count
            ),
            Err(e) => tracing::warn!("Document {} on {} failed: {}", op.method.as_str(), op.target, e),
        }
        result
    }

    async fn health_check(&self) -> DbResult<HealthStatus> {
        let started = Instant::now();
        let (healthy, message) = match self.store.read().await.as_ref() {
            None => (false, Some("not connected".to_string())),
            Some(kv) => match kv.get(b"meta:health") {
                Ok(_) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            },
        };
        Ok(HealthStatus {
            healthy,
            engine: EngineKind::Document,
            latency_ms: started.elapsed().as_millis() as u64,
            message,
        })
    }

    async fn transaction(&self, work: TransactionFn) -> DbResult<Value> {
        let store = self.store("transaction").await?;
        let _writer = self.write_lock.lock().await;

        let mut handle = DocumentTransaction {
            session: Session::new(&store),
            metrics: &self.metrics,
        };
        match work(&mut handle).await {
            Ok(value) => {
                let staged = handle
                    .session
                    .commit()
                    .map_err(|e| DbError::Transaction { message: format!("commit failed: {}", e) })?;
                self.metrics.record_commit();
                tracing::debug!("Document transaction committed {} staged writes", staged);
                Ok(value)
            }
            Err(err) => {
                self.metrics.record_rollback();
                tracing::debug!("Document transaction discarded: {}", err);
                Err(err)
            }
        }
    }

    async fn get_statistics(&self) -> DbResult<AdapterStats> {
        let guard = self.store.read().await;
        let details = match guard.as_ref() {
            Some(kv) => json!({
                "data_dir": self.config.database,
                "collections": Self::collections(kv)?.len(),
                "documents": kv.count_prefix(b"doc:").map_err(|e| storage_error("get_statistics", e))?,
                "estimated_keys": kv.estimate_num_keys().map_err(|e| storage_error("get_statistics", e))?,
            }),
            None => json!({ "data_dir": self.config.database }),
        };
        Ok(self.metrics.snapshot(EngineKind::Document, guard.is_some(), details))
    }

    async fn get_schema(&self) -> DbResult<SchemaInfo> {
        let store = self.store("get_schema").await?;
        let session = Session::new(&store);

        let mut collections = Vec::new();
        for name in Self::collections(&store)? {
            let docs = session.load(&name)?;
            if docs.is_empty() {
                continue;
            }
            let sample = &docs[..docs.len().min(SCHEMA_SAMPLE_SIZE)];
            collections.push(infer_schema(&name, sample, docs.len() as u64));
        }
        Ok(SchemaInfo {
            engine: EngineKind::Document,
            collections,
        })
    }
}

impl std::fmt::Debug for DocumentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentAdapter")
            .field("data_dir", &self.config.database)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::transaction_fn;
    use crate::query::{Operator, QueryBuilder};
    use tempfile::tempdir;

    async fn open(dir: &std::path::Path) -> DocumentAdapter {
        let adapter = DocumentAdapter::new(ConnectionConfig::document(dir.to_string_lossy()));
        adapter.connect().await.unwrap();
        adapter
    }

    fn doc(q: QueryBuilder) -> Statement {
        q.build_for(EngineKind::Document).unwrap()
    }

    async fn seed(db: &DocumentAdapter) {
        db.execute(&doc(QueryBuilder::table("users").insert_many(vec![
            json!({ "_id": "u1", "name": "Ann", "age": 31, "role": "admin" }),
            json!({ "_id": "u2", "name": "Bob", "age": 17, "role": "user" }),
            json!({ "_id": "u3", "name": "Cid", "age": 45, "role": "user" }),
        ])))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_emitted_find_runs() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        seed(&db).await;

        let result = db
            .execute(&doc(
                QueryBuilder::table("users")
                    .select(["name"])
                    .where_op("age", Operator::Gte, 18)
                    .order_by("age", "DESC"),
            ))
            .await
            .unwrap();
        let names: Vec<&str> = result.rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Cid", "Ann"]);
        assert_eq!(Value::Object(result.rows[0].clone()), json!({ "_id": "u3", "name": "Cid" }));

        let searched = db
            .execute(&doc(QueryBuilder::table("users").search(["name", "role"], "AD")))
            .await
            .unwrap();
        assert_eq!(searched.rows.len(), 1);

        let count = db
            .execute(&doc(QueryBuilder::table("users").where_("role", "user").count()))
            .await
            .unwrap();
        assert_eq!(count.count(), Some(2));

        let page = db
            .execute(&doc(QueryBuilder::table("users").order_by("_id", "ASC").offset(1).limit(1)))
            .await
            .unwrap();
        assert_eq!(page.rows[0]["_id"], json!("u2"));
    }

    #[tokio::test]
    async fn test_insert_generates_ids_and_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;

        let r = db
            .execute(&doc(QueryBuilder::table("notes").insert(json!({ "text": "hi" }))))
            .await
            .unwrap();
        let id = r.inserted_id.unwrap();
        assert!(id.as_str().map(|s| s.len() == 36).unwrap_or(false));

        seed(&db).await;
        let err = db
            .execute(&doc(QueryBuilder::table("users").insert(json!({ "_id": "u1" }))))
            .await
            .unwrap_err();
        match err {
            DbError::Engine(e) => assert_eq!(e.code.as_deref(), Some("DUPLICATE_KEY")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        seed(&db).await;

        let updated = db
            .execute(&doc(QueryBuilder::table("users").set("role", "member").where_("role", "user")))
            .await
            .unwrap();
        assert_eq!(updated.affected_count, 2);

        let deleted = db
            .execute(&doc(QueryBuilder::table("users").delete().where_op("age", Operator::Lt, 18)))
            .await
            .unwrap();
        assert_eq!(deleted.affected_count, 1);

        let members = db
            .execute(&doc(QueryBuilder::table("users").where_("role", "member")))
            .await
            .unwrap();
        assert_eq!(members.rows.len(), 1);
        assert_eq!(members.rows[0]["_id"], json!("u3"));
    }

    #[tokio::test]
    async fn test_aggregate_with_lookup() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        seed(&db).await;
        db.execute(&doc(QueryBuilder::table("orders").insert_many(vec![
            json!({ "user_id": "u1", "total": 10 }),
            json!({ "user_id": "u1", "total": 15 }),
            json!({ "user_id": "u3", "total": 7 }),
        ])))
        .await
        .unwrap();

        let result = db
            .execute(&doc(
                QueryBuilder::table("orders")
                    .group_stage(json!({ "_id": "$user_id", "spent": { "$sum": "$total" } }))
                    .lookup_stage("users", "_id", "_id", "user")
                    .unwind_stage("user")
                    .sort_stage(json!({ "spent": -1 }))
                    .project_stage(json!({ "_id": 0, "name": "$user.name", "spent": 1 })),
            ))
            .await
            .unwrap();
        let rows: Vec<Value> = result.rows.into_iter().map(Value::Object).collect();
        assert_eq!(rows, vec![json!({ "name": "Ann", "spent": 25 }), json!({ "name": "Cid", "spent": 7 })]);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_discard() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        seed(&db).await;

        let ins = doc(QueryBuilder::table("users").insert(json!({ "_id": "u4", "name": "Dee" })));
        let del = doc(QueryBuilder::table("users").delete().where_("_id", "u1"));
        let err = db
            .transaction(transaction_fn(move |tx| {
                Box::pin(async move {
                    tx.execute(&ins).await?;
                    let seen = tx.execute(&doc(QueryBuilder::table("users").count())).await?;
                    assert_eq!(seen.count(), Some(4));
                    tx.execute(&del).await?;
                    Err(DbError::validation("abort"))
                })
            }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "validation error: abort");
        let count = db.execute(&doc(QueryBuilder::table("users").count())).await.unwrap();
        assert_eq!(count.count(), Some(3));

        let ins = doc(QueryBuilder::table("users").insert(json!({ "_id": "u4", "name": "Dee" })));
        db.transaction(transaction_fn(move |tx| {
            Box::pin(async move {
                tx.execute(&ins).await?;
                Ok(Value::Null)
            })
        }))
        .await
        .unwrap();
        let count = db.execute(&doc(QueryBuilder::table("users").count())).await.unwrap();
        assert_eq!(count.count(), Some(4));

        let stats = db.get_statistics().await.unwrap();
        assert_eq!(stats.transactions_committed, 1);
        assert_eq!(stats.transactions_rolled_back, 1);
        assert_eq!(stats.details["documents"], json!(4));
        assert_eq!(stats.details["collections"], json!(1));
    }

    #[tokio::test]
    async fn test_failed_statement_in_transaction_stages_nothing() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        seed(&db).await;

        let ins = doc(QueryBuilder::table("users").insert_many(vec![
            json!({ "_id": "u9", "name": "New" }),
            json!({ "_id": "u1", "name": "Clash" }),
        ]));
        let bump = doc(QueryBuilder::table("users").set("role", "staff").where_("_id", "u2"));
        db.transaction(transaction_fn(move |tx| {
            Box::pin(async move {
                let dup = tx.execute(&ins).await.unwrap_err();
                assert!(matches!(dup, DbError::Engine(_)));
                tx.execute(&bump).await?;
                Ok(Value::Null)
            })
        }))
        .await
        .unwrap();

        let count = db.execute(&doc(QueryBuilder::table("users").count())).await.unwrap();
        assert_eq!(count.count(), Some(3));
        let u9 = db.execute(&doc(QueryBuilder::table("users").where_("_id", "u9"))).await.unwrap();
        assert!(u9.rows.is_empty());
        let u2 = db.execute(&doc(QueryBuilder::table("users").where_("_id", "u2"))).await.unwrap();
        assert_eq!(u2.rows[0]["role"], json!("staff"));
    }

    #[tokio::test]
    async fn test_ids_of_different_types_do_not_collide() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;

        db.execute(&doc(QueryBuilder::table("items").insert_many(vec![
            json!({ "_id": "1", "kind": "text" }),
            json!({ "_id": 1, "kind": "number" }),
        ])))
        .await
        .unwrap();

        let all = db.execute(&doc(QueryBuilder::table("items").count())).await.unwrap();
        assert_eq!(all.count(), Some(2));
        let by_number = db.execute(&doc(QueryBuilder::table("items").where_("_id", 1))).await.unwrap();
        assert_eq!(by_number.rows.len(), 1);
        assert_eq!(by_number.rows[0]["kind"], json!("number"));

        let err = db
            .execute(&doc(QueryBuilder::table("items").insert(json!({ "_id": 1 }))))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Engine(_)));
    }

    #[tokio::test]
    async fn test_data_survives_reopen_and_schema() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path()).await;
            seed(&db).await;
            db.disconnect().await.unwrap();
            assert!(!db.health_check().await.unwrap().healthy);
        }

        let db = open(dir.path()).await;
        assert!(db.health_check().await.unwrap().healthy);
        let schema = db.get_schema().await.unwrap();
        let users = schema.collection("users").unwrap();
        assert_eq!(users.row_count, Some(3));
        let id = users.fields.iter().find(|f| f.name == "_id").unwrap();
        assert!(id.primary_key);
        assert_eq!(users.fields.iter().find(|f| f.name == "age").unwrap().data_type, "integer");
    }

    #[tokio::test]
    async fn test_sql_statement_rejected() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        let err = db
            .execute(&QueryBuilder::table("users").build_for(EngineKind::Sqlite).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_client_error());
    }
}
