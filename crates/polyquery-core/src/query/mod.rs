// Query Translation Module
//
// One fluent description of a query, two target artifacts:
// parameterized SQL for relational engines and structured operations for the document store.

pub mod descriptor;
pub mod builder;
pub mod sql;
pub mod document;

pub use descriptor::{
    Condition, Join, JoinKind, Logic, Operation, Operator, OrderBy, PipelineStage, Predicate,
    QueryDescriptor, Row,
};
pub use builder::{IntoRow, QueryBuilder};
pub use sql::{MySqlDialect, PostgresDialect, SqlDialect, SqlEmitter, SqlStatement, SqliteDialect};
pub use document::{DocumentEmitter, DocumentMethod, DocumentOperation};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A finalized artifact ready for an adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Statement {
    Sql(SqlStatement),
    Document(DocumentOperation),
}

impl Statement {
    pub fn target(&self) -> &str {
        match self {
            Statement::Sql(s) => &s.target,
            Statement::Document(d) => &d.target,
        }
    }

    pub fn is_read(&self) -> bool {
        match self {
            Statement::Sql(s) => s.operation.is_read(),
            Statement::Document(d) => d.method.is_read(),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Statement::Sql(s) if s.operation == Operation::Raw)
    }

    /// Hand-written SQL; see [`SqlStatement::raw`].
    pub fn raw(sql: impl Into<String>) -> Self {
        Statement::Sql(SqlStatement::raw(sql))
    }

    /// Every table or collection whose contents feed the result: the target,
    /// joined tables, and `$lookup` sources at any pipeline depth.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = vec![self.target().to_string()];
        match self {
            Statement::Sql(s) => deps.extend(s.sources.iter().cloned()),
            Statement::Document(d) => {
                if let Some(stages) = &d.pipeline {
                    collect_lookups(stages, &mut deps);
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        deps.retain(|d| !d.is_empty() && seen.insert(d.clone()));
        deps
    }

    /// Short label for logs and error context.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Statement::Sql(s) => s.operation.as_str(),
            Statement::Document(d) => d.method.as_str(),
        }
    }
}

fn collect_lookups(stages: &[Value], out: &mut Vec<String>) {
    for stage in stages {
        let Some(lookup) = stage.get("$lookup") else {
            continue;
        };
        if let Some(from) = lookup.get("from").and_then(Value::as_str) {
            out.push(from.to_string());
        }
        if let Some(Value::Array(inner)) = lookup.get("pipeline") {
            collect_lookups(inner, out);
        }
    }
}

impl From<SqlStatement> for Statement {
    fn from(s: SqlStatement) -> Self {
        Statement::Sql(s)
    }
}

impl From<DocumentOperation> for Statement {
    fn from(d: DocumentOperation) -> Self {
        Statement::Document(d)
    }
}
