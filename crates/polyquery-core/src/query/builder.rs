// Query Builder - fluent accumulator over a QueryDescriptor.
// Every chained call consumes the builder and hands it back, so a query
// can be composed in one expression and branched with clone().

use polyquery_common::{DbResult, EngineKind, SortDirection};
use serde_json::{json, Value};

use super::descriptor::{
    Condition, Join, JoinKind, Logic, Operation, Operator, OrderBy, PipelineStage, Predicate,
    QueryDescriptor, Row,
};
use super::document::{DocumentEmitter, DocumentOperation};
use super::sql::{SqlEmitter, SqlStatement};
use super::Statement;

/// Anything that can become an insert/update row.
///
/// A JSON value that is not an object becomes an empty row, which the
/// emitters reject as "no data".
pub trait IntoRow {
    fn into_row(self) -> Row;
}

impl IntoRow for Row {
    fn into_row(self) -> Row {
        self
    }
}

impl IntoRow for Value {
    fn into_row(self) -> Row {
        match self {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryBuilder {
    descriptor: QueryDescriptor,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a builder already pointed at a table or collection.
    pub fn table(target: impl Into<String>) -> Self {
        Self::new().from(target)
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> QueryDescriptor {
        self.descriptor
    }

    /// Drop all accumulated state. Clones taken earlier are unaffected.
    pub fn reset(&mut self) -> &mut Self {
        self.descriptor = QueryDescriptor::default();
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.operation = Operation::Select;
        self.descriptor.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn from(mut self, target: impl Into<String>) -> Self {
        self.descriptor.target = Some(target.into());
        self
    }

    // --- predicates ---

    fn push_predicate(mut self, predicate: Predicate) -> Self {
        self.descriptor.conditions.push(Condition::Predicate(predicate));
        self
    }

    /// Two-value form: the operator is always equality.
    pub fn where_(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push_predicate(Predicate::new(field, Operator::Eq, value.into()))
    }

    pub fn where_op(self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.push_predicate(Predicate::new(field, operator, value.into()))
    }

    pub fn or_where(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push_predicate(Predicate::new(field, Operator::Eq, value.into()).or())
    }

    pub fn or_where_op(self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.push_predicate(Predicate::new(field, operator, value.into()).or())
    }

    pub fn where_in<I, V>(self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.push_predicate(Predicate::new(field, Operator::In, Value::Array(values)))
    }

    pub fn where_between(self, field: impl Into<String>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        self.push_predicate(Predicate::new(
            field,
            Operator::Between,
            Value::Array(vec![low.into(), high.into()]),
        ))
    }

    pub fn where_like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.push_predicate(Predicate::new(field, Operator::Like, Value::String(pattern.into())))
    }

    pub fn where_null(self, field: impl Into<String>) -> Self {
        self.push_predicate(Predicate::new(field, Operator::IsNull, Value::Null))
    }

    pub fn where_not_null(self, field: impl Into<String>) -> Self {
        self.push_predicate(Predicate::new(field, Operator::IsNotNull, Value::Null))
    }

    pub fn where_text(self, field: impl Into<String>, term: impl Into<String>) -> Self {
        self.push_predicate(Predicate::new(field, Operator::TextSearch, Value::String(term.into())))
    }

    /// AND a parenthesized OR-block of predicates.
    pub fn where_any(mut self, predicates: Vec<Predicate>) -> Self {
        if !predicates.is_empty() {
            self.descriptor.conditions.push(Condition::any_of(Logic::And, predicates));
        }
        self
    }

    /// OR a parenthesized OR-block of predicates.
    pub fn or_where_any(mut self, predicates: Vec<Predicate>) -> Self {
        if !predicates.is_empty() {
            self.descriptor.conditions.push(Condition::any_of(Logic::Or, predicates));
        }
        self
    }

    /// Multi-field search: `(f1 LIKE %term% OR f2 LIKE %term% ...)`.
    pub fn search<I, S>(self, fields: I, term: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let term = term.trim();
        if term.is_empty() {
            return self;
        }
        let pattern = Value::String(format!("%{}%", term));
        let predicates = fields
            .into_iter()
            .map(|f| Predicate::new(f, Operator::Like, pattern.clone()))
            .collect();
        self.where_any(predicates)
    }

    // --- joins / grouping / ordering ---

    pub fn join(self, table: impl Into<String>, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.push_join(JoinKind::Inner, table, left, right)
    }

    pub fn left_join(self, table: impl Into<String>, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.push_join(JoinKind::Left, table, left, right)
    }

    fn push_join(mut self, kind: JoinKind, table: impl Into<String>, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.descriptor.joins.push(Join {
            kind,
            table: table.into(),
            left: left.into(),
            right: right.into(),
        });
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.group_by.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn having(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.descriptor
            .having
            .push(Condition::Predicate(Predicate::new(field, operator, value.into())));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: impl Into<SortDirection>) -> Self {
        self.descriptor.order_by.push(OrderBy {
            field: field.into(),
            direction: direction.into(),
        });
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.descriptor.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.descriptor.offset = Some(n);
        self
    }

    // --- write operations ---

    pub fn insert(mut self, row: impl IntoRow) -> Self {
        self.descriptor.operation = Operation::Insert;
        self.descriptor.rows.push(row.into_row());
        self
    }

    pub fn insert_many<I, R>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoRow,
    {
        self.descriptor.operation = Operation::Insert;
        self.descriptor.rows.extend(rows.into_iter().map(IntoRow::into_row));
        self
    }

    pub fn update(mut self, fields: impl IntoRow) -> Self {
        self.descriptor.operation = Operation::Update;
        self.descriptor.updates.extend(fields.into_row());
        self
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.descriptor.operation = Operation::Update;
        self.descriptor.updates.insert(field.into(), value.into());
        self
    }

    pub fn delete(mut self) -> Self {
        self.descriptor.operation = Operation::Delete;
        self
    }

    pub fn count(mut self) -> Self {
        self.descriptor.operation = Operation::Count;
        self
    }

    // --- aggregation pipeline ---

    pub fn aggregate<I>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.descriptor.operation = Operation::Aggregate;
        self.descriptor.pipeline.extend(stages.into_iter().map(PipelineStage));
        self
    }

    fn push_stage(self, stage: Value) -> Self {
        self.aggregate(std::iter::once(stage))
    }

    pub fn match_stage(self, filter: Value) -> Self {
        self.push_stage(json!({ "$match": filter }))
    }

    pub fn group_stage(self, spec: Value) -> Self {
        self.push_stage(json!({ "$group": spec }))
    }

    pub fn lookup_stage(self, from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Self {
        self.push_stage(json!({
            "$lookup": {
                "from": from,
                "localField": local_field,
                "foreignField": foreign_field,
                "as": as_field,
            }
        }))
    }

    pub fn unwind_stage(self, path: &str) -> Self {
        let path = if path.starts_with('$') { path.to_string() } else { format!("${}", path) };
        self.push_stage(json!({ "$unwind": path }))
    }

    pub fn project_stage(self, spec: Value) -> Self {
        self.push_stage(json!({ "$project": spec }))
    }

    pub fn sort_stage(self, spec: Value) -> Self {
        self.push_stage(json!({ "$sort": spec }))
    }

    pub fn skip_stage(self, n: u64) -> Self {
        self.push_stage(json!({ "$skip": n }))
    }

    pub fn limit_stage(self, n: u64) -> Self {
        self.push_stage(json!({ "$limit": n }))
    }

    // --- terminals ---

    pub fn to_sql(&self, emitter: &SqlEmitter) -> DbResult<SqlStatement> {
        emitter.emit(&self.descriptor)
    }

    /// Parameters aligned with the placeholders of `to_sql`.
    pub fn params(&self, emitter: &SqlEmitter) -> DbResult<Vec<Value>> {
        Ok(emitter.emit(&self.descriptor)?.params)
    }

    pub fn to_document(&self) -> DbResult<DocumentOperation> {
        DocumentEmitter::new().emit(&self.descriptor)
    }

    /// Emit whichever artifact the engine consumes.
    pub fn build_for(&self, engine: EngineKind) -> DbResult<Statement> {
        if engine.is_relational() {
            Ok(Statement::Sql(self.to_sql(&SqlEmitter::for_engine(engine))?))
        } else {
            Ok(Statement::Document(self.to_document()?))
        }
    }
}
