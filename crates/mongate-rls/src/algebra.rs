//! Filter document algebra.
//!
//! Pure functions over predicate trees. Every function returns a freshly
//! allocated document and touches no shared state.

use mongate_core::FilterDocument;
use serde_json::{Map, Value};

pub const AND: &str = "$and";
pub const OR: &str = "$or";
pub const NOR: &str = "$nor";

/// Extended-JSON type wrappers. Objects keyed by one of these are literal
/// values, not operator objects.
const EXTENDED_JSON_KEYS: &[&str] = &[
    "$oid",
    "$date",
    "$numberInt",
    "$numberLong",
    "$numberDouble",
    "$numberDecimal",
    "$binary",
    "$uuid",
    "$timestamp",
    "$regularExpression",
];

/// A `(FieldPath, literal)` pair visited by [`map_leaves`].
#[derive(Debug, Clone, Copy)]
pub struct Leaf<'a> {
    /// Full dot path of the field.
    pub path: &'a str,
    /// Comparison operator wrapping the literal (`$gte`, `$in`, ...), or
    /// `None` for plain equality.
    pub operator: Option<&'a str>,
    /// The literal.
    pub value: &'a Value,
}

impl Leaf<'_> {
    /// Whether this is a plain `{path: literal}` equality.
    pub fn is_equality(&self) -> bool {
        self.operator.is_none()
    }
}

/// Whether a key is a logical operator tag.
pub fn is_logical(key: &str) -> bool {
    matches!(key, AND | OR | NOR)
}

/// AND `clause` onto `doc`.
///
/// - an empty `doc` yields `clause`; an empty `clause` yields `doc`
/// - a `doc` with a top-level `$and` gets `clause` appended, unless an equal
///   element is already present
/// - otherwise the result is `{"$and": [doc, clause]}`, unless `doc` already
///   equals `clause`
///
/// The operation is idempotent: merging the same clause twice is the same as
/// merging it once.
pub fn merge_clause(mut doc: FilterDocument, clause: &FilterDocument) -> FilterDocument {
    if clause.is_empty() {
        return doc;
    }
    if doc.is_empty() {
        return clause.clone();
    }
    if &doc == clause {
        return doc;
    }

    if let Some(Value::Array(conditions)) = doc.get_mut(AND) {
        let clause = Value::Object(clause.clone());
        if !conditions.contains(&clause) {
            conditions.push(clause);
        }
        return doc;
    }

    let mut merged = Map::with_capacity(1);
    merged.insert(
        AND.to_string(),
        Value::Array(vec![Value::Object(doc), Value::Object(clause.clone())]),
    );
    merged
}

/// Whether `doc` structurally requires every constraint of `clause` at the
/// top level, looking through nested `$and` conjunctions.
pub fn requires_clause(doc: &FilterDocument, clause: &FilterDocument) -> bool {
    if clause.iter().all(|(key, value)| doc.get(key) == Some(value)) {
        return true;
    }
    match doc.get(AND) {
        Some(Value::Array(conditions)) => conditions.iter().any(|condition| match condition {
            Value::Object(condition) => requires_clause(condition, clause),
            _ => false,
        }),
        _ => false,
    }
}

/// Build `{path: value}`, constructing nested objects for dotted paths.
///
/// `build_clause("company._id", v)` yields `{"company": {"_id": v}}`.
pub fn build_clause(path: &str, value: Value) -> FilterDocument {
    let mut segments = path.rsplit('.');
    let last = segments.next().unwrap_or(path);

    let mut clause = Map::with_capacity(1);
    clause.insert(last.to_string(), value);

    for segment in segments {
        let mut outer = Map::with_capacity(1);
        outer.insert(segment.to_string(), Value::Object(clause));
        clause = outer;
    }
    clause
}

/// Rebuild `doc`, replacing every leaf literal with `f(leaf)`.
///
/// Nested documents extend the path with `.`; `$and`/`$or`/`$nor` sequences
/// are recursed into under the current path. Operator objects are recursed
/// into at their literal, with the operator reported on the [`Leaf`];
/// `$elemMatch` and `$not` bodies are recursed into as documents. Other
/// top-level operators (`$expr`, `$text`, ...) are copied unchanged.
pub fn map_leaves<F>(doc: &FilterDocument, mut f: F) -> FilterDocument
where
    F: FnMut(Leaf<'_>) -> Value,
{
    map_document(doc, "", &mut f)
}

fn map_document<F>(doc: &FilterDocument, prefix: &str, f: &mut F) -> FilterDocument
where
    F: FnMut(Leaf<'_>) -> Value,
{
    let mut out = Map::with_capacity(doc.len());
    for (key, value) in doc {
        let mapped = if is_logical(key) {
            map_logical(value, prefix, f)
        } else if key.starts_with('$') {
            value.clone()
        } else {
            let path = join_path(prefix, key);
            map_value(&path, value, f)
        };
        out.insert(key.clone(), mapped);
    }
    out
}

fn map_logical<F>(value: &Value, prefix: &str, f: &mut F) -> Value
where
    F: FnMut(Leaf<'_>) -> Value,
{
    match value {
        Value::Array(conditions) => Value::Array(
            conditions
                .iter()
                .map(|condition| match condition {
                    Value::Object(doc) => Value::Object(map_document(doc, prefix, f)),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn map_value<F>(path: &str, value: &Value, f: &mut F) -> Value
where
    F: FnMut(Leaf<'_>) -> Value,
{
    match value {
        Value::Object(map) if map.is_empty() || is_literal_object(map) => f(Leaf {
            path,
            operator: None,
            value,
        }),
        Value::Object(map) if is_operator_object(map) => Value::Object(map_operators(path, map, f)),
        Value::Object(map) => Value::Object(map_document(map, path, f)),
        _ => f(Leaf {
            path,
            operator: None,
            value,
        }),
    }
}

fn map_operators<F>(path: &str, operators: &Map<String, Value>, f: &mut F) -> Map<String, Value>
where
    F: FnMut(Leaf<'_>) -> Value,
{
    let mut out = Map::with_capacity(operators.len());
    for (operator, operand) in operators {
        let mapped = match (operator.as_str(), operand) {
            ("$elemMatch" | "$not", Value::Object(_)) => map_value(path, operand, f),
            (_, Value::Object(inner)) if !is_literal_object(inner) => operand.clone(),
            _ => f(Leaf {
                path,
                operator: Some(operator),
                value: operand,
            }),
        };
        out.insert(operator.clone(), mapped);
    }
    out
}

fn is_literal_object(map: &Map<String, Value>) -> bool {
    map.len() == 1
        && map
            .keys()
            .next()
            .is_some_and(|key| EXTENDED_JSON_KEYS.contains(&key.as_str()))
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|key| key.starts_with('$'))
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}
