// Document evaluation: projections, update operators and aggregation stages.

use polyquery_common::{DbError, DbResult};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::matcher::{get_path, matches, sort_cmp, sort_documents, values_equal};
use crate::query::Row;

/// `"$field"` resolves against the document, objects evaluate member-wise,
/// anything else is a literal.
pub(crate) fn eval_expr(doc: &Row, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null),
        Value::Object(m) => {
            let mut out = Map::new();
            for (k, v) in m {
                out.insert(k.clone(), eval_expr(doc, v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn is_falsy(v: &Value) -> bool {
    matches!(v, Value::Bool(false)) || v.as_f64() == Some(0.0)
}

fn f64_value(x: f64) -> Value {
    serde_json::Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

pub(crate) fn set_path(doc: &mut Row, path: &str, value: Value) -> DbResult<()> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().unwrap_or(path);
    let mut current = doc;
    for part in parts {
        let next = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = next
            .as_object_mut()
            .ok_or_else(|| DbError::validation(format!("cannot set {}: {} is not an object", path, part)))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

pub(crate) fn remove_path(doc: &mut Row, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.remove(path),
        Some((parent, leaf)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.get_mut(part)?.as_object_mut()?;
            }
            current.remove(leaf)
        }
    }
}

/// Apply a `{field: 1}` / `{field: 0}` / `{field: "$expr"}` projection.
pub(crate) fn project(doc: &Row, spec: &Map<String, Value>) -> DbResult<Row> {
    let include_id = !spec.get("_id").map(is_falsy).unwrap_or(false);
    let inclusive = spec.values().any(|v| !is_falsy(v));

    if !inclusive {
        let mut out = doc.clone();
        for k in spec.keys() {
            remove_path(&mut out, k);
        }
        return Ok(out);
    }

    let mut out = Row::new();
    if include_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (k, v) in spec {
        if k == "_id" {
            continue;
        }
        match v {
            Value::String(s) if s.starts_with('$') => {
                out.insert(k.clone(), eval_expr(doc, v));
            }
            v if is_falsy(v) => {
                return Err(DbError::validation(format!(
                    "projection cannot mix inclusion and exclusion (field {})",
                    k
                )));
            }
            _ => {
                if let Some(val) = get_path(doc, k) {
                    set_path(&mut out, k, val.clone())?;
                }
            }
        }
    }
    Ok(out)
}

/// Apply `$set`, `$unset`, `$inc` and `$push` to one document.
pub(crate) fn apply_update(doc: &mut Row, update: &Value) -> DbResult<()> {
    let ops = update
        .as_object()
        .filter(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
        .ok_or_else(|| DbError::validation("update document must contain only update operators"))?;

    for (op, fields) in ops {
        let fields = fields
            .as_object()
            .ok_or_else(|| DbError::validation(format!("{} expects an object", op)))?;
        for (path, operand) in fields {
            if path == "_id" {
                let unchanged = op == "$set" && doc.get("_id").map(|id| values_equal(id, operand)).unwrap_or(false);
                if !unchanged {
                    return Err(DbError::validation("_id is immutable"));
                }
                continue;
            }
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone())?,
                "$unset" => {
                    remove_path(doc, path);
                }
                "$inc" => {
                    let delta = operand
                        .as_f64()
                        .ok_or_else(|| DbError::validation(format!("$inc on {} needs a number", path)))?;
                    let next = match get_path(doc, path) {
                        None | Some(Value::Null) => operand.clone(),
                        Some(current) => {
                            let base = current.as_f64().ok_or_else(|| {
                                DbError::validation(format!("$inc on non-numeric field {}", path))
                            })?;
                            // Integer sums that leave i64 range continue as doubles.
                            match (current.as_i64(), operand.as_i64()) {
                                (Some(a), Some(b)) => match a.checked_add(b) {
                                    Some(sum) => json!(sum),
                                    None => f64_value(base + delta),
                                },
                                _ => f64_value(base + delta),
                            }
                        }
                    };
                    set_path(doc, path, next)?;
                }
                "$push" => {
                    let next = match get_path(doc, path) {
                        None | Some(Value::Null) => vec![operand.clone()],
                        Some(Value::Array(items)) => {
                            let mut items = items.clone();
                            items.push(operand.clone());
                            items
                        }
                        Some(_) => return Err(DbError::validation(format!("$push on non-array field {}", path))),
                    };
                    set_path(doc, path, Value::Array(next))?;
                }
                other => return Err(DbError::validation(format!("unsupported update operator: {}", other))),
            }
        }
    }
    Ok(())
}

fn stage_parts(stage: &Value) -> DbResult<(&str, &Value)> {
    match stage.as_object() {
        Some(m) if m.len() == 1 => m
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| DbError::validation("empty pipeline stage")),
        _ => Err(DbError::validation("each pipeline stage must be an object with exactly one key")),
    }
}

fn stage_object<'a>(name: &str, spec: &'a Value) -> DbResult<&'a Map<String, Value>> {
    spec.as_object()
        .ok_or_else(|| DbError::validation(format!("{} expects an object", name)))
}

fn stage_count(name: &str, spec: &Value) -> DbResult<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| DbError::validation(format!("{} expects a non-negative integer", name)))
}

/// Run an aggregation pipeline; `load` fetches other collections for `$lookup`.
pub(crate) fn run_pipeline<F>(mut docs: Vec<Row>, stages: &[Value], mut load: F) -> DbResult<Vec<Row>>
where
    F: FnMut(&str) -> DbResult<Vec<Row>>,
{
    for stage in stages {
        let (name, spec) = stage_parts(stage)?;
        docs = match name {
            "$match" => {
                let filter = stage_object(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => {
                let spec = stage_object(name, spec)?;
                docs.iter().map(|d| project(d, spec)).collect::<DbResult<Vec<_>>>()?
            }
            "$addFields" | "$set" => {
                let spec = stage_object(name, spec)?;
                for doc in docs.iter_mut() {
                    for (k, expr) in spec {
                        let v = eval_expr(doc, expr);
                        set_path(doc, k, v)?;
                    }
                }
                docs
            }
            "$sort" => {
                sort_documents(&mut docs, stage_object(name, spec)?);
                docs
            }
            "$skip" => docs.into_iter().skip(stage_count(name, spec)?).collect(),
            "$limit" => {
                docs.truncate(stage_count(name, spec)?);
                docs
            }
            "$unwind" => unwind(docs, spec)?,
            "$group" => group(docs, stage_object(name, spec)?)?,
            "$lookup" => lookup(docs, stage_object(name, spec)?, &mut load)?,
            "$count" => {
                let field = spec
                    .as_str()
                    .filter(|s| !s.is_empty() && !s.starts_with('$'))
                    .ok_or_else(|| DbError::validation("$count expects a field name"))?;
                let mut row = Row::new();
                row.insert(field.to_string(), json!(docs.len()));
                vec![row]
            }
            other => return Err(DbError::validation(format!("unsupported pipeline stage: {}", other))),
        };
    }
    Ok(docs)
}

fn unwind(docs: Vec<Row>, spec: &Value) -> DbResult<Vec<Row>> {
    let (path, preserve) = match spec {
        Value::String(p) => (p.as_str(), false),
        Value::Object(m) => (
            m.get("path").and_then(Value::as_str).unwrap_or_default(),
            m.get("preserveNullAndEmptyArrays").and_then(Value::as_bool).unwrap_or(false),
        ),
        _ => ("", false),
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| DbError::validation("$unwind path must start with '$'"))?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match get_path(&doc, field).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut d = doc.clone();
                    set_path(&mut d, field, item)?;
                    out.push(d);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup<F>(docs: Vec<Row>, spec: &Map<String, Value>, load: &mut F) -> DbResult<Vec<Row>>
where
    F: FnMut(&str) -> DbResult<Vec<Row>>,
{
    let field = |key: &str| {
        spec.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| DbError::validation(format!("$lookup requires '{}'", key)))
    };
    let (from, local, foreign, as_field) = (field("from")?, field("localField")?, field("foreignField")?, field("as")?);
    let foreign_docs = load(from)?;

    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let local_value = get_path(&doc, local).cloned().unwrap_or(Value::Null);
        let joined: Vec<Value> = foreign_docs
            .iter()
            .filter(|f| lookup_match(&local_value, get_path(f, foreign).unwrap_or(&Value::Null)))
            .map(|f| Value::Object(f.clone()))
            .collect();
        set_path(&mut doc, as_field, Value::Array(joined))?;
        out.push(doc);
    }
    Ok(out)
}

fn lookup_match(local: &Value, foreign: &Value) -> bool {
    match (local, foreign) {
        (Value::Array(items), f) => items.iter().any(|i| values_equal(i, f)),
        (l, Value::Array(items)) => items.iter().any(|i| values_equal(l, i)),
        (l, f) => values_equal(l, f),
    }
}

enum AccState {
    Sum { total: f64, all_int: bool },
    Avg { total: f64, n: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Count(u64),
}

struct Accumulator {
    expr: Value,
    state: AccState,
}

impl Accumulator {
    fn parse(field: &str, spec: &Value) -> DbResult<Self> {
        let (op, expr) = spec
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| DbError::validation(format!("$group field {} must be {{ $op: expr }}", field)))?;
        let state = match op.as_str() {
            "$sum" => AccState::Sum { total: 0.0, all_int: true },
            "$avg" => AccState::Avg { total: 0.0, n: 0 },
            "$min" => AccState::Min(None),
            "$max" => AccState::Max(None),
            "$push" => AccState::Push(Vec::new()),
            "$addToSet" => AccState::AddToSet(Vec::new()),
            "$first" => AccState::First(None),
            "$last" => AccState::Last(None),
            "$count" => AccState::Count(0),
            other => return Err(DbError::validation(format!("unsupported accumulator: {}", other))),
        };
        Ok(Self { expr: expr.clone(), state })
    }

    fn add(&mut self, doc: &Row) {
        let v = eval_expr(doc, &self.expr);
        match &mut self.state {
            AccState::Sum { total, all_int } => {
                if let Some(n) = v.as_f64() {
                    *total += n;
                    if !(v.is_i64() || v.is_u64()) {
                        *all_int = false;
                    }
                }
            }
            AccState::Avg { total, n } => {
                if let Some(x) = v.as_f64() {
                    *total += x;
                    *n += 1;
                }
            }
            AccState::Min(cur) => {
                if !v.is_null() && cur.as_ref().map(|c| sort_cmp(Some(&v), Some(c)) == Ordering::Less).unwrap_or(true) {
                    *cur = Some(v);
                }
            }
            AccState::Max(cur) => {
                if !v.is_null() && cur.as_ref().map(|c| sort_cmp(Some(&v), Some(c)) == Ordering::Greater).unwrap_or(true) {
                    *cur = Some(v);
                }
            }
            AccState::Push(items) => items.push(v),
            AccState::AddToSet(items) => {
                if !items.iter().any(|i| values_equal(i, &v)) {
                    items.push(v);
                }
            }
            AccState::First(cur) => {
                if cur.is_none() {
                    *cur = Some(v);
                }
            }
            AccState::Last(cur) => *cur = Some(v),
            AccState::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> Value {
        match self.state {
            AccState::Sum { total, all_int: true } => json!(total as i64),
            AccState::Sum { total, .. } => f64_value(total),
            AccState::Avg { n: 0, .. } => Value::Null,
            AccState::Avg { total, n } => f64_value(total / n as f64),
            AccState::Min(v) | AccState::Max(v) | AccState::First(v) | AccState::Last(v) => v.unwrap_or(Value::Null),
            AccState::Push(items) | AccState::AddToSet(items) => Value::Array(items),
            AccState::Count(n) => json!(n),
        }
    }
}

/// Groups come out in order of first appearance.
fn group(docs: Vec<Row>, spec: &Map<String, Value>) -> DbResult<Vec<Row>> {
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| DbError::validation("$group requires an _id"))?;

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Value, Vec<(String, Accumulator)>)> = HashMap::new();
    for doc in &docs {
        let id = eval_expr(doc, id_expr);
        let key = id.to_string();
        let entry = match groups.entry(key.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let mut accs = Vec::new();
                for (field, acc_spec) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
                    accs.push((field.clone(), Accumulator::parse(field, acc_spec)?));
                }
                order.push(key);
                e.insert((id, accs))
            }
        };
        for (_, acc) in entry.1.iter_mut() {
            acc.add(doc);
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|k| groups.remove(&k))
        .map(|(id, accs)| {
            let mut row = Row::new();
            row.insert("_id".to_string(), id);
            for (field, acc) in accs {
                row.insert(field, acc.finish());
            }
            row
        })
        .collect())
}
