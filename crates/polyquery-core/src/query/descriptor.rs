// Query Descriptor - canonical, engine-agnostic form of one query.
// Both emitters read it; neither mutates it.

use polyquery_common::{DbError, DbResult, SortDirection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row shape used for inserts and updates. Key order is insertion order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
    Count,
    Aggregate,
    /// Hand-written statement (DDL, pragmas); never produced by the builder.
    Raw,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Count => "count",
            Operation::Aggregate => "aggregate",
            Operation::Raw => "raw",
        }
    }

    /// Reads are cacheable; writes invalidate.
    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Select | Operation::Count | Operation::Aggregate)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Between,
    Like,
    IsNull,
    IsNotNull,
    TextSearch,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "IN",
            Operator::Between => "BETWEEN",
            Operator::Like => "LIKE",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
            Operator::TextSearch => "TEXT",
        }
    }

    pub fn parse(token: &str) -> DbResult<Self> {
        let normalized = token.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        let op = match normalized.as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            "IN" => Operator::In,
            "BETWEEN" => Operator::Between,
            "LIKE" => Operator::Like,
            "IS NULL" => Operator::IsNull,
            "IS NOT NULL" => Operator::IsNotNull,
            "TEXT" | "SEARCH" | "MATCH" => Operator::TextSearch,
            _ => {
                return Err(DbError::validation(format!("unsupported operator: {}", token)));
            }
        };
        Ok(op)
    }
}

impl std::str::FromStr for Operator {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::parse(s)
    }
}

/// Connector joining a condition to the one before it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Logic {
    #[default]
    And,
    Or,
}

impl Logic {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    pub logic: Logic,
}

impl Predicate {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logic: Logic::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.logic = Logic::Or;
        self
    }
}

/// One entry in a where/having list: a single predicate or a parenthesized group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Condition {
    Predicate(Predicate),
    Group { logic: Logic, conditions: Vec<Condition> },
}

impl Condition {
    pub fn logic(&self) -> Logic {
        match self {
            Condition::Predicate(p) => p.logic,
            Condition::Group { logic, .. } => *logic,
        }
    }

    /// Build a group whose members are joined by OR.
    pub fn any_of(logic: Logic, predicates: Vec<Predicate>) -> Self {
        let conditions = predicates
            .into_iter()
            .enumerate()
            .map(|(i, mut p)| {
                p.logic = if i == 0 { Logic::And } else { Logic::Or };
                Condition::Predicate(p)
            })
            .collect();
        Condition::Group { logic, conditions }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Opaque aggregation stage, emitted verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PipelineStage(pub Value);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryDescriptor {
    pub operation: Operation,
    pub target: Option<String>,
    pub fields: Vec<String>,
    pub conditions: Vec<Condition>,
    pub joins: Vec<Join>,
    pub order_by: Vec<OrderBy>,
    pub group_by: Vec<String>,
    pub having: Vec<Condition>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub rows: Vec<Row>,
    pub updates: Row,
    pub pipeline: Vec<PipelineStage>,
}

impl QueryDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_name(&self) -> DbResult<&str> {
        self.target.as_deref().filter(|t| !t.is_empty()).ok_or_else(|| {
            DbError::validation_for("no target table", self.operation.as_str(), None)
        })
    }

    /// Every predicate in declaration order, groups expanded depth-first.
    pub fn predicates(&self) -> Vec<&Predicate> {
        fn walk<'a>(conditions: &'a [Condition], out: &mut Vec<&'a Predicate>) {
            for c in conditions {
                match c {
                    Condition::Predicate(p) => out.push(p),
                    Condition::Group { conditions, .. } => walk(conditions, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.conditions, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_parse_tokens() {
        assert_eq!(Operator::parse("=").unwrap(), Operator::Eq);
        assert_eq!(Operator::parse("<>").unwrap(), Operator::Ne);
        assert_eq!(Operator::parse("is  not null").unwrap(), Operator::IsNotNull);
        assert_eq!("between".parse::<Operator>().unwrap(), Operator::Between);
        assert!(Operator::parse("~=").is_err());
    }

    #[test]
    fn test_any_of_sets_or_connectors() {
        let group = Condition::any_of(
            Logic::And,
            vec![
                Predicate::new("a", Operator::Eq, json!(1)),
                Predicate::new("b", Operator::Eq, json!(2)),
            ],
        );
        match group {
            Condition::Group { logic, conditions } => {
                assert_eq!(logic, Logic::And);
                assert_eq!(conditions[0].logic(), Logic::And);
                assert_eq!(conditions[1].logic(), Logic::Or);
            }
            _ => panic!("expected group"),
        }
    }

    #[test]
    fn test_missing_target_is_validation_error() {
        let d = QueryDescriptor::new();
        let err = d.target_name().unwrap_err();
        assert!(err.to_string().contains("no target table"));
    }

    #[test]
    fn test_predicates_flatten_groups_in_order() {
        let mut d = QueryDescriptor::new();
        d.conditions.push(Condition::Predicate(Predicate::new("x", Operator::Gt, json!(0))));
        d.conditions.push(Condition::any_of(
            Logic::And,
            vec![
                Predicate::new("y", Operator::Like, json!("%a%")),
                Predicate::new("z", Operator::Like, json!("%a%")),
            ],
        ));
        let fields: Vec<_> = d.predicates().iter().map(|p| p.field.as_str()).collect();
        assert_eq!(fields, vec!["x", "y", "z"]);
    }
}
