// Document-Store Emitter - descriptor -> structured operation / pipeline.

use polyquery_common::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::descriptor::{Condition, Logic, Operation, Operator, Predicate, QueryDescriptor, Row};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DocumentMethod {
    #[serde(rename = "find")]
    Find,
    #[serde(rename = "countDocuments")]
    CountDocuments,
    #[serde(rename = "insertMany")]
    InsertMany,
    #[serde(rename = "updateMany")]
    UpdateMany,
    #[serde(rename = "deleteMany")]
    DeleteMany,
    #[serde(rename = "aggregate")]
    Aggregate,
}

impl DocumentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentMethod::Find => "find",
            DocumentMethod::CountDocuments => "countDocuments",
            DocumentMethod::InsertMany => "insertMany",
            DocumentMethod::UpdateMany => "updateMany",
            DocumentMethod::DeleteMany => "deleteMany",
            DocumentMethod::Aggregate => "aggregate",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            DocumentMethod::Find | DocumentMethod::CountDocuments | DocumentMethod::Aggregate
        )
    }
}

/// Structured operation consumed by a document-store adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentOperation {
    pub target: String,
    pub method: DocumentMethod,
    pub filter: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<Value>>,
}

impl DocumentOperation {
    fn new(target: String, method: DocumentMethod) -> Self {
        Self {
            target,
            method,
            filter: Map::new(),
            projection: None,
            sort: None,
            skip: None,
            limit: None,
            update: None,
            documents: None,
            pipeline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentEmitter;

impl DocumentEmitter {
    pub fn new() -> Self {
        Self
    }

    pub fn emit(&self, d: &QueryDescriptor) -> DbResult<DocumentOperation> {
        let target = d.target_name()?.to_string();
        self.warn_relational_only(d, &target);

        let op = match d.operation {
            Operation::Select => {
                let mut op = DocumentOperation::new(target, DocumentMethod::Find);
                op.filter = translate_conditions(&d.conditions)?;
                op.projection = projection(&d.fields);
                if !d.order_by.is_empty() {
                    let mut sort = Map::new();
                    for o in &d.order_by {
                        sort.insert(o.field.clone(), json!(o.direction.as_document()));
                    }
                    op.sort = Some(sort);
                }
                op.skip = d.offset;
                op.limit = d.limit;
                op
            }
            Operation::Count => {
                let mut op = DocumentOperation::new(target, DocumentMethod::CountDocuments);
                op.filter = translate_conditions(&d.conditions)?;
                op
            }
            Operation::Insert => {
                if d.rows.is_empty() || d.rows.iter().all(|r| r.is_empty()) {
                    return Err(DbError::validation_for("no data to insert", "insert", Some(&target)));
                }
                let mut op = DocumentOperation::new(target, DocumentMethod::InsertMany);
                op.documents = Some(d.rows.clone());
                op
            }
            Operation::Update => {
                if d.updates.is_empty() {
                    return Err(DbError::validation_for("no data to update", "update", Some(&target)));
                }
                let mut op = DocumentOperation::new(target, DocumentMethod::UpdateMany);
                op.filter = translate_conditions(&d.conditions)?;
                op.update = Some(json!({ "$set": Value::Object(d.updates.clone()) }));
                op
            }
            Operation::Delete => {
                let mut op = DocumentOperation::new(target, DocumentMethod::DeleteMany);
                op.filter = translate_conditions(&d.conditions)?;
                op
            }
            Operation::Aggregate => {
                let mut op = DocumentOperation::new(target, DocumentMethod::Aggregate);
                op.pipeline = Some(d.pipeline.iter().map(|s| s.0.clone()).collect());
                op
            }
            Operation::Raw => {
                return Err(DbError::validation_for("unsupported operation: raw", "raw", Some(&target)));
            }
        };

        tracing::debug!(target = %op.target, method = op.method.as_str(), "Emitted document operation");
        Ok(op)
    }

    /// Joins and grouping have no find() equivalent; they are dropped, not rejected.
    fn warn_relational_only(&self, d: &QueryDescriptor, target: &str) {
        if !d.joins.is_empty() {
            let tables: Vec<&str> = d.joins.iter().map(|j| j.table.as_str()).collect();
            tracing::warn!(
                "Ignoring {} join(s) on document collection '{}' ({:?}); use lookup_stage() in an aggregation pipeline instead",
                d.joins.len(),
                target,
                tables
            );
        }
        if !d.group_by.is_empty() || !d.having.is_empty() {
            tracing::warn!(
                "Ignoring GROUP BY/HAVING on document collection '{}'; use group_stage() instead",
                target
            );
        }
    }
}

fn projection(fields: &[String]) -> Option<Map<String, Value>> {
    let fields: Vec<&String> = fields.iter().filter(|f| f.as_str() != "*").collect();
    if fields.is_empty() {
        return None;
    }
    let mut proj = Map::new();
    for f in fields {
        proj.insert(f.clone(), json!(1));
    }
    Some(proj)
}

/// Translate a condition list into one filter document.
///
/// AND binds tighter than OR: the list is split into OR-separated terms,
/// each term becomes one merged fragment, and more than one term becomes `$or`.
pub fn translate_conditions(conditions: &[Condition]) -> DbResult<Map<String, Value>> {
    let mut terms: Vec<Vec<&Condition>> = Vec::new();
    for c in conditions {
        if c.logic() == Logic::Or && !terms.is_empty() {
            terms.push(vec![c]);
        } else if let Some(last) = terms.last_mut() {
            last.push(c);
        } else {
            terms.push(vec![c]);
        }
    }

    let mut fragments = Vec::with_capacity(terms.len());
    for term in terms {
        let mut merged = Map::new();
        for c in term {
            let fragment = match c {
                Condition::Predicate(p) => translate_predicate(p)?,
                Condition::Group { conditions, .. } => translate_conditions(conditions)?,
            };
            merge_fragment(&mut merged, fragment);
        }
        if !merged.is_empty() {
            fragments.push(merged);
        }
    }

    Ok(match fragments.len() {
        0 => Map::new(),
        1 => fragments.remove(0),
        _ => {
            let mut filter = Map::new();
            filter.insert(
                "$or".to_string(),
                Value::Array(fragments.into_iter().map(Value::Object).collect()),
            );
            filter
        }
    })
}

fn translate_predicate(p: &Predicate) -> DbResult<Map<String, Value>> {
    let mut fragment = Map::new();
    let condition = match p.operator {
        Operator::Eq => p.value.clone(),
        Operator::Ne => json!({ "$ne": p.value }),
        Operator::Gt => json!({ "$gt": p.value }),
        Operator::Gte => json!({ "$gte": p.value }),
        Operator::Lt => json!({ "$lt": p.value }),
        Operator::Lte => json!({ "$lte": p.value }),
        Operator::In => {
            let values = match &p.value {
                Value::Array(items) => items.clone(),
                Value::Null => Vec::new(),
                other => vec![other.clone()],
            };
            json!({ "$in": values })
        }
        Operator::Between => match &p.value {
            Value::Array(bounds) if bounds.len() == 2 => {
                json!({ "$gte": bounds[0], "$lte": bounds[1] })
            }
            _ => {
                return Err(DbError::validation(format!(
                    "BETWEEN on {} requires exactly two values",
                    p.field
                )));
            }
        },
        Operator::Like => {
            let pattern = p.value.as_str().ok_or_else(|| {
                DbError::validation(format!("LIKE on {} requires a string pattern", p.field))
            })?;
            json!({ "$regex": like_to_regex(pattern), "$options": "i" })
        }
        Operator::IsNull => Value::Null,
        Operator::IsNotNull => json!({ "$ne": null }),
        Operator::TextSearch => {
            fragment.insert("$text".to_string(), json!({ "$search": p.value }));
            return Ok(fragment);
        }
    };
    fragment.insert(p.field.clone(), condition);
    Ok(fragment)
}

/// Merge `fragment` into `target`. Operator objects on the same field are
/// combined; anything that would collide is moved under `$and`.
fn merge_fragment(target: &mut Map<String, Value>, fragment: Map<String, Value>) {
    for (key, value) in fragment {
        match target.get_mut(&key) {
            None => {
                target.insert(key, value);
            }
            Some(existing) => {
                let combinable = is_operator_object(existing)
                    && is_operator_object(&value)
                    && value
                        .as_object()
                        .map(|v| v.keys().all(|k| existing.get(k).is_none()))
                        .unwrap_or(false);
                if combinable {
                    if let (Some(dst), Value::Object(src)) = (existing.as_object_mut(), value) {
                        dst.extend(src);
                    }
                } else {
                    let mut clause = Map::new();
                    clause.insert(key, value);
                    let and = target
                        .entry("$and".to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = and {
                        items.push(Value::Object(clause));
                    }
                }
            }
        }
    }
}

fn is_operator_object(v: &Value) -> bool {
    v.as_object()
        .map(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
        .unwrap_or(false)
}

/// SQL LIKE pattern -> case-insensitive regex.
///
/// Literal runs go through `regex::escape`; `%` becomes `.*` and `_` becomes `.`.
/// A pattern without a leading or trailing `%` is anchored on that side.
pub fn like_to_regex(pattern: &str) -> String {
    let open_start = pattern.starts_with('%');
    let inner = if open_start { &pattern[1..] } else { pattern };
    let open_end = (open_start && inner.is_empty()) || inner.ends_with('%');
    let inner = if open_end { inner.strip_suffix('%').unwrap_or(inner) } else { inner };

    let mut out = String::new();
    if !open_start {
        out.push('^');
    }
    let mut literal = String::new();
    for ch in inner.chars() {
        match ch {
            '%' | '_' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if ch == '%' { ".*" } else { "." });
            }
            c => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    if !open_end {
        out.push('$');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Predicate, QueryBuilder};
    use serde_json::json;

    #[test]
    fn test_select_scenario() {
        let op = QueryBuilder::new()
            .select(["id", "name"])
            .from("users")
            .where_("active", true)
            .order_by("created_at", "DESC")
            .limit(10)
            .to_document()
            .unwrap();

        assert_eq!(op.method, DocumentMethod::Find);
        assert_eq!(op.target, "users");
        assert_eq!(Value::Object(op.filter), json!({ "active": true }));
        assert_eq!(op.sort.map(Value::Object), Some(json!({ "created_at": -1 })));
        assert_eq!(op.limit, Some(10));
        assert_eq!(op.projection.map(Value::Object), Some(json!({ "id": 1, "name": 1 })));
    }

    #[test]
    fn test_search_becomes_top_level_or() {
        let op = QueryBuilder::table("products")
            .search(["name", "description"], "laptop")
            .to_document()
            .unwrap();

        assert_eq!(
            Value::Object(op.filter),
            json!({
                "$or": [
                    { "name": { "$regex": "laptop", "$options": "i" } },
                    { "description": { "$regex": "laptop", "$options": "i" } }
                ]
            })
        );
    }

    #[test]
    fn test_between_is_combined_bound() {
        let op = QueryBuilder::table("orders").where_between("total", 10, 20).to_document().unwrap();
        assert_eq!(Value::Object(op.filter), json!({ "total": { "$gte": 10, "$lte": 20 } }));
    }

    #[test]
    fn test_operator_mapping() {
        let op = QueryBuilder::table("t")
            .where_op("a", Operator::Ne, 1)
            .where_op("b", Operator::Gt, 2)
            .where_op("c", Operator::Lte, 3)
            .where_in("d", ["x", "y"])
            .where_null("e")
            .where_not_null("f")
            .where_text("body", "rust async")
            .to_document()
            .unwrap();

        assert_eq!(
            Value::Object(op.filter),
            json!({
                "a": { "$ne": 1 },
                "b": { "$gt": 2 },
                "c": { "$lte": 3 },
                "d": { "$in": ["x", "y"] },
                "e": null,
                "f": { "$ne": null },
                "$text": { "$search": "rust async" }
            })
        );
    }

    #[test]
    fn test_same_field_ranges_merge() {
        let op = QueryBuilder::table("t")
            .where_op("age", Operator::Gte, 18)
            .where_op("age", Operator::Lt, 65)
            .to_document()
            .unwrap();
        assert_eq!(Value::Object(op.filter), json!({ "age": { "$gte": 18, "$lt": 65 } }));

        let op = QueryBuilder::table("t").where_("age", 18).where_("age", 19).to_document().unwrap();
        assert_eq!(Value::Object(op.filter), json!({ "age": 18, "$and": [{ "age": 19 }] }));
    }

    #[test]
    fn test_or_marked_predicate_splits_terms() {
        let op = QueryBuilder::table("t")
            .where_("status", "active")
            .where_op("age", Operator::Gt, 18)
            .or_where("role", "admin")
            .to_document()
            .unwrap();

        assert_eq!(
            Value::Object(op.filter),
            json!({
                "$or": [
                    { "status": "active", "age": { "$gt": 18 } },
                    { "role": "admin" }
                ]
            })
        );
    }

    #[test]
    fn test_two_or_groups_are_anded() {
        let op = QueryBuilder::table("t")
            .search(["a", "b"], "x")
            .where_any(vec![
                Predicate::new("c", Operator::Eq, json!(1)),
                Predicate::new("d", Operator::Eq, json!(2)),
            ])
            .to_document()
            .unwrap();
        let filter = Value::Object(op.filter);
        assert!(filter["$or"].is_array());
        assert_eq!(filter["$and"][0]["$or"], json!([{ "c": 1 }, { "d": 2 }]));
    }

    #[test]
    fn test_joins_are_ignored_not_rejected() {
        let op = QueryBuilder::table("orders")
            .join("users", "orders.user_id", "users.id")
            .where_("paid", true)
            .to_document()
            .unwrap();
        assert_eq!(op.method, DocumentMethod::Find);
        assert_eq!(Value::Object(op.filter), json!({ "paid": true }));
    }

    #[test]
    fn test_pipeline_emitted_verbatim() {
        let stages = vec![
            json!({ "$sort": { "b": 1 } }),
            json!({ "$match": { "a": { "$gt": 1 } } }),
            json!({ "$limit": 3 }),
        ];
        let op = QueryBuilder::table("t").aggregate(stages.clone()).to_document().unwrap();
        assert_eq!(op.method, DocumentMethod::Aggregate);
        assert_eq!(op.pipeline, Some(stages));
    }

    #[test]
    fn test_write_operations() {
        let op = QueryBuilder::table("users")
            .insert(json!({ "name": "a" }))
            .to_document()
            .unwrap();
        assert_eq!(op.method, DocumentMethod::InsertMany);
        assert_eq!(op.documents.as_ref().map(|d| d.len()), Some(1));

        let op = QueryBuilder::table("users").set("name", "b").where_("_id", "1").to_document().unwrap();
        assert_eq!(op.method, DocumentMethod::UpdateMany);
        assert_eq!(op.update, Some(json!({ "$set": { "name": "b" } })));

        let op = QueryBuilder::table("users").delete().where_("_id", "1").to_document().unwrap();
        assert_eq!(op.method, DocumentMethod::DeleteMany);

        let err = QueryBuilder::table("users")
            .insert_many(Vec::<Value>::new())
            .to_document()
            .unwrap_err();
        assert!(err.to_string().contains("no data to insert"));
    }

    #[test]
    fn test_like_to_regex() {
        assert_eq!(like_to_regex("%laptop%"), "laptop");
        assert_eq!(like_to_regex("abc%"), "^abc");
        assert_eq!(like_to_regex("%abc"), "abc$");
        assert_eq!(like_to_regex("a_c"), "^a.c$");
        assert_eq!(like_to_regex("%1.5%"), "1\\.5");
        assert_eq!(like_to_regex("%"), "");
        assert_eq!(like_to_regex("a%b"), "^a.*b$");
    }

    #[test]
    fn test_like_to_regex_escapes_literal_runs() {
        let pattern = like_to_regex("a-b #c d%");
        assert_eq!(pattern, format!("^{}", regex::escape("a-b #c d")));

        let re = regex::RegexBuilder::new(&pattern).case_insensitive(true).build().unwrap();
        assert!(re.is_match("A-B #C D and more"));
        assert!(!re.is_match("xa-b #c d"));
        assert!(!re.is_match("a_b #c d"));

        let re = regex::Regex::new(&like_to_regex("%[x]_(y)%")).unwrap();
        assert!(re.is_match("pre [x]-(y) post"));
        assert!(!re.is_match("x-y"));
    }
}
