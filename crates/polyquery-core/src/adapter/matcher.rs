// Filter evaluation for the embedded document store.

use polyquery_common::{DbError, DbResult};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Resolve a dotted path (`address.city`, `items.0.sku`).
pub fn get_path<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(m) => m.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// True when `doc` satisfies every clause of `filter`.
pub fn matches(doc: &Map<String, Value>, filter: &Map<String, Value>) -> DbResult<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$or" => {
                let mut any = false;
                for f in sub_filters(key, condition)? {
                    if matches(doc, f)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$and" => {
                let mut all = true;
                for f in sub_filters(key, condition)? {
                    if !matches(doc, f)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$nor" => {
                let mut none = true;
                for f in sub_filters(key, condition)? {
                    if matches(doc, f)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$text" => text_matches(doc, condition),
            op if op.starts_with('$') => {
                return Err(DbError::validation(format!("unsupported top-level filter operator: {}", op)));
            }
            field => field_matches(get_path(doc, field), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(key: &str, condition: &'a Value) -> DbResult<Vec<&'a Map<String, Value>>> {
    let items = condition
        .as_array()
        .ok_or_else(|| DbError::validation(format!("{} expects an array of filters", key)))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| DbError::validation(format!("{} entries must be objects", key)))
        })
        .collect()
}

/// Case-insensitive: any search word found in any string value of the document.
fn text_matches(doc: &Map<String, Value>, condition: &Value) -> bool {
    let term = condition
        .get("$search")
        .and_then(Value::as_str)
        .or_else(|| condition.as_str())
        .unwrap_or_default()
        .to_lowercase();
    let words: Vec<&str> = term.split_whitespace().collect();
    if words.is_empty() {
        return false;
    }
    let mut strings = Vec::new();
    collect_strings(&Value::Object(doc.clone()), &mut strings);
    strings.iter().any(|s| {
        let s = s.to_lowercase();
        words.iter().any(|w| s.contains(w))
    })
}

fn collect_strings(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|i| collect_strings(i, out)),
        Value::Object(m) => m.values().for_each(|i| collect_strings(i, out)),
        _ => {}
    }
}

pub(crate) fn is_operator_object(v: &Value) -> bool {
    v.as_object()
        .map(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
        .unwrap_or(false)
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> DbResult<bool> {
    let ops = match condition {
        Value::Object(ops) if is_operator_object(condition) => ops,
        _ => return Ok(equals_or_contains(actual, condition)),
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_or_contains(actual, operand),
            "$ne" => !equals_or_contains(actual, operand),
            "$gt" => compare_with(actual, operand, |o| o == Ordering::Greater),
            "$gte" => compare_with(actual, operand, |o| o != Ordering::Less),
            "$lt" => compare_with(actual, operand, |o| o == Ordering::Less),
            "$lte" => compare_with(actual, operand, |o| o != Ordering::Greater),
            "$in" => in_list(actual, op, operand)?,
            "$nin" => !in_list(actual, op, operand)?,
            "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
            "$regex" => {
                let case_insensitive = ops
                    .get("$options")
                    .and_then(Value::as_str)
                    .map(|o| o.contains('i'))
                    .unwrap_or(false);
                regex_matches(actual, operand, case_insensitive)?
            }
            "$options" => true,
            other => return Err(DbError::validation(format!("unsupported filter operator: {}", other))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(actual: Option<&Value>, op: &str, operand: &Value) -> DbResult<bool> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| DbError::validation(format!("{} expects an array", op)))?;
    Ok(candidates.iter().any(|c| equals_or_contains(actual, c)))
}

fn regex_matches(actual: Option<&Value>, pattern: &Value, case_insensitive: bool) -> DbResult<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| DbError::validation("$regex expects a string pattern"))?;
    let re = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| DbError::validation(format!("invalid $regex: {}", e)))?;
    Ok(match actual {
        Some(Value::String(s)) => re.is_match(s),
        Some(Value::Array(items)) => items.iter().any(|i| i.as_str().map(|s| re.is_match(s)).unwrap_or(false)),
        _ => false,
    })
}

/// Equality with document-store semantics: `null` matches a missing field,
/// and a scalar matches an array that contains it.
fn equals_or_contains(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(v) if values_equal(v, expected) => true,
        Some(Value::Array(items)) => items.iter().any(|i| values_equal(i, expected)),
        Some(_) => false,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn compare_with(actual: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match actual {
        Some(Value::Array(items)) => items
            .iter()
            .any(|i| compare_same_type(i, operand).map(&accept).unwrap_or(false)),
        Some(v) => compare_same_type(v, operand).map(accept).unwrap_or(false),
        None => false,
    }
}

/// Range operators only compare values of the same kind.
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used by `$sort` and find(): null/missing first, then numbers,
/// strings, objects, arrays, booleans.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_same_type(x, y).unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
        _ => Ordering::Equal,
    }
}

/// Order documents by a `{field: 1 | -1}` spec.
pub fn sort_documents(docs: &mut [Map<String, Value>], spec: &Map<String, Value>) {
    docs.sort_by(|a, b| {
        for (field, dir) in spec {
            let ord = sort_cmp(get_path(a, field), get_path(b, field));
            let ord = if dir.as_i64().unwrap_or(1) < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn check(d: &Value, f: Value) -> bool {
        matches(&doc(d.clone()), &doc(f)).unwrap()
    }

    #[test]
    fn test_equality_and_null() {
        let d = json!({ "name": "ann", "age": 30, "tags": ["a", "b"], "addr": { "city": "Oslo" } });
        assert!(check(&d, json!({ "name": "ann" })));
        assert!(check(&d, json!({ "age": 30.0 })));
        assert!(check(&d, json!({ "tags": "b" })));
        assert!(check(&d, json!({ "addr.city": "Oslo" })));
        assert!(check(&d, json!({ "deleted_at": null })));
        assert!(!check(&d, json!({ "name": null })));
        assert!(check(&d, json!({ "name": { "$ne": null } })));
    }

    #[test]
    fn test_range_and_membership() {
        let d = json!({ "age": 30, "role": "dev" });
        assert!(check(&d, json!({ "age": { "$gte": 18, "$lt": 65 } })));
        assert!(!check(&d, json!({ "age": { "$gt": 30 } })));
        assert!(!check(&d, json!({ "age": { "$gt": "10" } })));
        assert!(check(&d, json!({ "role": { "$in": ["ops", "dev"] } })));
        assert!(check(&d, json!({ "role": { "$nin": ["ops"] } })));
        assert!(check(&d, json!({ "email": { "$exists": false } })));
    }

    #[test]
    fn test_logical_operators() {
        let d = json!({ "a": 1, "b": 2 });
        assert!(check(&d, json!({ "$or": [{ "a": 5 }, { "b": 2 }] })));
        assert!(!check(&d, json!({ "$and": [{ "a": 1 }, { "b": 3 }] })));
        assert!(check(&d, json!({ "$nor": [{ "a": 2 }] })));
    }

    #[test]
    fn test_regex_and_text() {
        let d = json!({ "name": "Gaming Laptop", "body": "Fast and quiet" });
        assert!(check(&d, json!({ "name": { "$regex": "laptop", "$options": "i" } })));
        assert!(!check(&d, json!({ "name": { "$regex": "laptop" } })));
        assert!(check(&d, json!({ "$text": { "$search": "QUIET desk" } })));
        assert!(!check(&d, json!({ "$text": { "$search": "slow" } })));
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let err = matches(&doc(json!({ "a": 1 })), &doc(json!({ "a": { "$near": 1 } }))).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_sort_documents() {
        let mut docs = vec![
            doc(json!({ "n": 2, "s": "b" })),
            doc(json!({ "s": "z" })),
            doc(json!({ "n": 1, "s": "c" })),
            doc(json!({ "n": 2, "s": "a" })),
        ];
        sort_documents(&mut docs, &doc(json!({ "n": -1, "s": 1 })));
        let order: Vec<&str> = docs.iter().map(|d| d["s"].as_str().unwrap()).collect();
        assert_eq!(order, vec!["a", "b", "c", "z"]);
    }
}
