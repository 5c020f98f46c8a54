// SQL Emitter - descriptor -> dialect text + ordered parameters.
// The dialect is chosen once when the emitter is built; clause assembly is shared.

use polyquery_common::{DbError, DbResult, EngineKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::descriptor::{Condition, Operation, Operator, Predicate, QueryDescriptor};

/// Parameterized SQL ready for execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub operation: Operation,
    pub target: String,
    /// Joined tables the statement also reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl SqlStatement {
    /// Hand-written SQL such as DDL. Runs as-is: the cached executor neither
    /// caches it nor invalidates anything for it.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            operation: Operation::Raw,
            target: String::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}

/// Per-engine differences in SQL text.
pub trait SqlDialect: Send + Sync + std::fmt::Debug {
    fn engine(&self) -> EngineKind;

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String>;

    fn text_search(&self, field: &str, placeholder: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (Some(l), Some(o)) => Some(format!("LIMIT {} OFFSET {}", l, o)),
            (Some(l), None) => Some(format!("LIMIT {}", l)),
            // SQLite has no bare OFFSET
            (None, Some(o)) => Some(format!("LIMIT -1 OFFSET {}", o)),
            (None, None) => None,
        }
    }

    fn text_search(&self, field: &str, placeholder: &str) -> String {
        format!("{} MATCH {}", field, placeholder)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (Some(l), Some(o)) => Some(format!("LIMIT {} OFFSET {}", l, o)),
            (Some(l), None) => Some(format!("LIMIT {}", l)),
            (None, Some(o)) => Some(format!("OFFSET {}", o)),
            (None, None) => None,
        }
    }

    fn text_search(&self, field: &str, placeholder: &str) -> String {
        format!("to_tsvector({}) @@ plainto_tsquery({})", field, placeholder)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn engine(&self) -> EngineKind {
        EngineKind::Mysql
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (Some(l), Some(o)) => Some(format!("LIMIT {} OFFSET {}", l, o)),
            (Some(l), None) => Some(format!("LIMIT {}", l)),
            // MySQL documents the max u64 as "no limit"
            (None, Some(o)) => Some(format!("LIMIT {} OFFSET {}", u64::MAX, o)),
            (None, None) => None,
        }
    }

    fn text_search(&self, field: &str, placeholder: &str) -> String {
        format!("MATCH({}) AGAINST ({})", field, placeholder)
    }
}

/// Collects bound values and hands out the matching placeholder text.
struct ParamSink<'a> {
    dialect: &'a dyn SqlDialect,
    params: Vec<Value>,
}

impl<'a> ParamSink<'a> {
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }
}

#[derive(Debug, Clone)]
pub struct SqlEmitter {
    dialect: Arc<dyn SqlDialect>,
}

impl SqlEmitter {
    pub fn new(dialect: Arc<dyn SqlDialect>) -> Self {
        Self { dialect }
    }

    /// Dialect for a relational engine. The document engine has no SQL form;
    /// it falls back to SQLite text so callers still get a usable emitter.
    pub fn for_engine(engine: EngineKind) -> Self {
        let dialect: Arc<dyn SqlDialect> = match engine {
            EngineKind::Postgres => Arc::new(PostgresDialect),
            EngineKind::Mysql => Arc::new(MySqlDialect),
            EngineKind::Sqlite | EngineKind::Document => Arc::new(SqliteDialect),
        };
        Self::new(dialect)
    }

    pub fn sqlite() -> Self {
        Self::new(Arc::new(SqliteDialect))
    }

    pub fn postgres() -> Self {
        Self::new(Arc::new(PostgresDialect))
    }

    pub fn mysql() -> Self {
        Self::new(Arc::new(MySqlDialect))
    }

    pub fn engine(&self) -> EngineKind {
        self.dialect.engine()
    }

    pub fn emit(&self, descriptor: &QueryDescriptor) -> DbResult<SqlStatement> {
        let target = descriptor.target_name()?.to_string();
        let mut sink = ParamSink {
            dialect: self.dialect.as_ref(),
            params: Vec::new(),
        };

        let sql = match descriptor.operation {
            Operation::Select => self.emit_select(descriptor, &target, &mut sink)?,
            Operation::Count => self.emit_count(descriptor, &target, &mut sink)?,
            Operation::Insert => self.emit_insert(descriptor, &target, &mut sink)?,
            Operation::Update => self.emit_update(descriptor, &target, &mut sink)?,
            Operation::Delete => self.emit_delete(descriptor, &target, &mut sink)?,
            other => {
                return Err(DbError::validation_for(
                    format!("unsupported operation: {}", other),
                    other.as_str(),
                    Some(&target),
                ));
            }
        };

        tracing::debug!(dialect = %self.dialect.engine(), sql = %sql, params = sink.params.len(), "Emitted SQL");

        let mut sources: Vec<String> = Vec::new();
        for join in &descriptor.joins {
            if join.table != target && !sources.contains(&join.table) {
                sources.push(join.table.clone());
            }
        }

        Ok(SqlStatement {
            sql,
            params: sink.params,
            operation: descriptor.operation,
            target,
            sources,
        })
    }

    fn emit_select(&self, d: &QueryDescriptor, target: &str, sink: &mut ParamSink) -> DbResult<String> {
        let projection = if d.fields.is_empty() { "*".to_string() } else { d.fields.join(", ") };
        let mut sql = format!("SELECT {} FROM {}", projection, target);

        self.push_joins(&mut sql, d);
        self.push_where(&mut sql, &d.conditions, sink)?;

        if !d.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&d.group_by.join(", "));
        }
        if !d.having.is_empty() {
            let having = render_conditions(&d.having, sink)?;
            if !having.is_empty() {
                sql.push_str(" HAVING ");
                sql.push_str(&having);
            }
        }
        if !d.order_by.is_empty() {
            let order: Vec<String> = d
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.field, o.direction.as_sql()))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        if let Some(clause) = self.dialect.limit_offset(d.limit, d.offset) {
            sql.push(' ');
            sql.push_str(&clause);
        }
        Ok(sql)
    }

    fn emit_count(&self, d: &QueryDescriptor, target: &str, sink: &mut ParamSink) -> DbResult<String> {
        let mut sql = format!("SELECT COUNT(*) AS count FROM {}", target);
        self.push_joins(&mut sql, d);
        self.push_where(&mut sql, &d.conditions, sink)?;
        Ok(sql)
    }

    fn emit_insert(&self, d: &QueryDescriptor, target: &str, sink: &mut ParamSink) -> DbResult<String> {
        let columns: Vec<&String> = match d.rows.first() {
            Some(first) if !first.is_empty() => first.keys().collect(),
            _ => {
                return Err(DbError::validation_for("no data to insert", "insert", Some(target)));
            }
        };

        let mut tuples = Vec::with_capacity(d.rows.len());
        for row in &d.rows {
            let placeholders: Vec<String> = columns
                .iter()
                .map(|c| sink.bind(row.get(c.as_str()).cloned().unwrap_or(Value::Null)))
                .collect();
            tuples.push(format!("({})", placeholders.join(", ")));
        }

        let column_list: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES {}",
            target,
            column_list.join(", "),
            tuples.join(", ")
        ))
    }

    fn emit_update(&self, d: &QueryDescriptor, target: &str, sink: &mut ParamSink) -> DbResult<String> {
        if d.updates.is_empty() {
            return Err(DbError::validation_for("no data to update", "update", Some(target)));
        }
        let assignments: Vec<String> = d
            .updates
            .iter()
            .map(|(field, value)| format!("{} = {}", field, sink.bind(value.clone())))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", target, assignments.join(", "));
        self.push_where(&mut sql, &d.conditions, sink)?;
        Ok(sql)
    }

    fn emit_delete(&self, d: &QueryDescriptor, target: &str, sink: &mut ParamSink) -> DbResult<String> {
        let mut sql = format!("DELETE FROM {}", target);
        self.push_where(&mut sql, &d.conditions, sink)?;
        Ok(sql)
    }

    fn push_joins(&self, sql: &mut String, d: &QueryDescriptor) {
        for join in &d.joins {
            sql.push_str(&format!(" {} {} ON {} = {}", join.kind.as_sql(), join.table, join.left, join.right));
        }
    }

    fn push_where(&self, sql: &mut String, conditions: &[Condition], sink: &mut ParamSink) -> DbResult<()> {
        let clause = render_conditions(conditions, sink)?;
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        Ok(())
    }
}

impl Default for SqlEmitter {
    fn default() -> Self {
        Self::sqlite()
    }
}

/// Render a condition list; the first rendered item's connector is dropped.
fn render_conditions(conditions: &[Condition], sink: &mut ParamSink) -> DbResult<String> {
    let mut out = String::new();
    for condition in conditions {
        let part = match condition {
            Condition::Predicate(p) => render_predicate(p, sink)?,
            Condition::Group { conditions, .. } => {
                let inner = render_conditions(conditions, sink)?;
                if inner.is_empty() {
                    continue;
                }
                format!("({})", inner)
            }
        };
        if !out.is_empty() {
            out.push(' ');
            out.push_str(condition.logic().as_sql());
            out.push(' ');
        }
        out.push_str(&part);
    }
    Ok(out)
}

fn render_predicate(p: &Predicate, sink: &mut ParamSink) -> DbResult<String> {
    let field = &p.field;
    let rendered = match p.operator {
        Operator::Eq | Operator::Ne | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte | Operator::Like => {
            format!("{} {} {}", field, p.operator.as_sql(), sink.bind(p.value.clone()))
        }
        Operator::In => {
            let values = match &p.value {
                Value::Array(items) => items.clone(),
                Value::Null => Vec::new(),
                other => vec![other.clone()],
            };
            if values.is_empty() {
                // IN () is not valid SQL; an empty set matches nothing
                "1 = 0".to_string()
            } else {
                let placeholders: Vec<String> = values.into_iter().map(|v| sink.bind(v)).collect();
                format!("{} IN ({})", field, placeholders.join(", "))
            }
        }
        Operator::Between => match &p.value {
            Value::Array(bounds) if bounds.len() == 2 => {
                let low = sink.bind(bounds[0].clone());
                let high = sink.bind(bounds[1].clone());
                format!("{} BETWEEN {} AND {}", field, low, high)
            }
            _ => {
                return Err(DbError::validation(format!(
                    "BETWEEN on {} requires exactly two values",
                    field
                )));
            }
        },
        Operator::IsNull => format!("{} IS NULL", field),
        Operator::IsNotNull => format!("{} IS NOT NULL", field),
        Operator::TextSearch => {
            let placeholder = sink.bind(p.value.clone());
            sink.dialect.text_search(field, &placeholder)
        }
    };
    Ok(rendered)
}

#[cfg(test)]
#[path = "sql_tests.rs"]
mod tests;
