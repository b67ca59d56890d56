//! Record filters and ordering for JSON records.
//!
//! A `where` object combines field conditions with `AND`, `OR` and `NOT`.
//! A field condition is either a plain value (equality) or an object of
//! operators:
//!
//! | operator | meaning |
//! |----------|---------|
//! | `equals`, `not` | equality / negation (`not` also takes a nested condition) |
//! | `in`, `notIn` | membership in an array |
//! | `lt`, `lte`, `gt`, `gte` | ordering on numbers, strings, booleans |
//! | `contains`, `startsWith`, `endsWith` | substring tests on strings |
//! | `mode: "insensitive"` | case-insensitive string comparison |

use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::DataAccessError;

pub type Record = Map<String, Value>;

const OPERATORS: [&str; 12] = [
    "equals",
    "not",
    "in",
    "notIn",
    "lt",
    "lte",
    "gt",
    "gte",
    "contains",
    "startsWith",
    "endsWith",
    "mode",
];

/// True when `record` satisfies every condition in `filter`.
pub fn matches(record: &Record, filter: &Record) -> Result<bool, DataAccessError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "AND" => each_filter(condition, "AND")?
                .into_iter()
                .try_fold(true, |acc, f| Ok::<_, DataAccessError>(acc && matches(record, f)?))?,
            "OR" => {
                let filters = each_filter(condition, "OR")?;
                let mut any = false;
                for f in filters {
                    if matches(record, f)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "NOT" => {
                let mut none = true;
                for f in each_filter(condition, "NOT")? {
                    if matches(record, f)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            field => field_matches(record.get(field).unwrap_or(&Value::Null), field, condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn each_filter<'a>(value: &'a Value, name: &str) -> Result<Vec<&'a Record>, DataAccessError> {
    match value {
        Value::Object(map) => Ok(vec![map]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    DataAccessError::new(format!("`{}` expects filter objects", name))
                })
            })
            .collect(),
        _ => Err(DataAccessError::new(format!(
            "`{}` expects an object or an array of objects",
            name
        ))),
    }
}

/// Whether `condition` is an operator object rather than a plain value.
pub fn is_condition(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| OPERATORS.contains(&k.as_str())),
        _ => false,
    }
}

/// Field names a `where` object refers to at its own level, looking through
/// `AND`, `OR` and `NOT`.
pub fn referenced_fields(filter: &Record) -> Vec<&str> {
    let mut fields = Vec::new();
    for (key, value) in filter {
        match key.as_str() {
            "AND" | "OR" | "NOT" => {
                let nested: Vec<&Record> = match value {
                    Value::Object(map) => vec![map],
                    Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
                    _ => Vec::new(),
                };
                for map in nested {
                    fields.extend(referenced_fields(map));
                }
            }
            field => fields.push(field),
        }
    }
    fields
}

fn field_matches(actual: &Value, field: &str, condition: &Value) -> Result<bool, DataAccessError> {
    let Value::Object(ops) = condition else {
        return Ok(values_equal(actual, condition, false));
    };
    if !is_condition(condition) {
        // A plain object value compares structurally.
        if let Some(unknown) = ops.keys().find(|k| !OPERATORS.contains(&k.as_str())) {
            if ops.keys().any(|k| OPERATORS.contains(&k.as_str())) {
                return Err(DataAccessError::new(format!(
                    "Unknown filter operator `{}` on field `{}`",
                    unknown, field
                )));
            }
        }
        return Ok(values_equal(actual, condition, false));
    }

    let insensitive = match ops.get("mode") {
        None => false,
        Some(Value::String(mode)) if mode == "insensitive" => true,
        Some(Value::String(mode)) if mode == "default" => false,
        Some(other) => {
            return Err(DataAccessError::new(format!(
                "Invalid value for `mode` on field `{}`: {}",
                field, other
            )));
        }
    };

    for (op, expected) in ops {
        let ok = match op.as_str() {
            "mode" => true,
            "equals" => values_equal(actual, expected, insensitive),
            "not" => {
                if is_condition(expected) {
                    !field_matches(actual, field, expected)?
                } else {
                    !values_equal(actual, expected, insensitive)
                }
            }
            "in" | "notIn" => {
                let Value::Array(list) = expected else {
                    return Err(DataAccessError::new(format!(
                        "`{}` on field `{}` expects an array",
                        op, field
                    )));
                };
                let found = list.iter().any(|v| values_equal(actual, v, insensitive));
                if op == "in" { found } else { !found }
            }
            "lt" | "lte" | "gt" | "gte" => match compare_values(actual, expected, insensitive) {
                Some(ord) => match op.as_str() {
                    "lt" => ord == Ordering::Less,
                    "lte" => ord != Ordering::Greater,
                    "gt" => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                },
                None => false,
            },
            "contains" | "startsWith" | "endsWith" => {
                let Value::String(needle) = expected else {
                    return Err(DataAccessError::new(format!(
                        "`{}` on field `{}` expects a string",
                        op, field
                    )));
                };
                match actual {
                    Value::String(hay) => {
                        let (hay, needle) = if insensitive {
                            (hay.to_lowercase(), needle.to_lowercase())
                        } else {
                            (hay.clone(), needle.clone())
                        };
                        match op.as_str() {
                            "contains" => hay.contains(&needle),
                            "startsWith" => hay.starts_with(&needle),
                            _ => hay.ends_with(&needle),
                        }
                    }
                    _ => false,
                }
            }
            other => {
                return Err(DataAccessError::new(format!(
                    "Unknown filter operator `{}` on field `{}`",
                    other, field
                )));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with numbers compared by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value, insensitive: bool) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::String(x), Value::String(y)) if insensitive => x.to_lowercase() == y.to_lowercase(),
        _ => a == b,
    }
}

/// Ordering between two values of the same primitive type.
pub fn compare_values(a: &Value, b: &Value, insensitive: bool) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) if insensitive => {
            Some(x.to_lowercase().cmp(&y.to_lowercase()))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// One `orderBy` key: a path into the record plus direction and null placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: Vec<String>,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    fn new(path: Vec<String>, descending: bool, nulls: Option<&str>) -> Self {
        // Nulls sort as the largest value unless told otherwise.
        let nulls_first = match nulls {
            Some("first") => true,
            Some(_) => false,
            None => descending,
        };
        Self {
            path,
            descending,
            nulls_first,
        }
    }

    fn lookup<'a>(&self, record: &'a Record) -> &'a Value {
        let mut current = record.get(&self.path[0]);
        for segment in &self.path[1..] {
            current = current.and_then(|v| v.get(segment));
        }
        current.unwrap_or(&Value::Null)
    }
}

/// Parse `orderBy`: `{ f: 'asc' }`, `[{ f: 'desc' }, ...]`,
/// `{ f: { sort: 'asc', nulls: 'last' } }` or `{ _count: { f: 'desc' } }`.
pub fn parse_order_by(value: &Value) -> Result<Vec<SortKey>, DataAccessError> {
    let entries: Vec<&Record> = match value {
        Value::Object(map) => vec![map],
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_object()
                    .ok_or_else(|| DataAccessError::new("`orderBy` entries must be objects"))
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(DataAccessError::new("`orderBy` must be an object or an array")),
    };

    let mut keys = Vec::new();
    for entry in entries {
        for (field, order) in entry {
            collect_sort_keys(vec![field.clone()], order, &mut keys)?;
        }
    }
    Ok(keys)
}

fn collect_sort_keys(
    path: Vec<String>,
    order: &Value,
    keys: &mut Vec<SortKey>,
) -> Result<(), DataAccessError> {
    match order {
        Value::String(dir) => keys.push(SortKey::new(path, direction(dir)?, None)),
        Value::Object(map) if map.contains_key("sort") => {
            let dir = map
                .get("sort")
                .and_then(Value::as_str)
                .ok_or_else(|| DataAccessError::new("`sort` must be 'asc' or 'desc'"))?;
            let nulls = map.get("nulls").and_then(Value::as_str);
            keys.push(SortKey::new(path, direction(dir)?, nulls));
        }
        Value::Object(map) => {
            for (field, inner) in map {
                let mut nested = path.clone();
                nested.push(field.clone());
                collect_sort_keys(nested, inner, keys)?;
            }
        }
        other => {
            return Err(DataAccessError::new(format!(
                "Invalid sort order {} for `{}`",
                other,
                path.join(".")
            )));
        }
    }
    Ok(())
}

fn direction(dir: &str) -> Result<bool, DataAccessError> {
    match dir {
        "asc" => Ok(false),
        "desc" => Ok(true),
        other => Err(DataAccessError::new(format!(
            "Invalid sort order '{}', expected 'asc' or 'desc'",
            other
        ))),
    }
}

/// Stable sort by the given keys.
pub fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for key in keys {
            let ord = compare_for_sort(key.lookup(a), key.lookup(b), key);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn compare_for_sort(a: &Value, b: &Value, key: &SortKey) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if key.nulls_first { Ordering::Less } else { Ordering::Greater }
        }
        (false, true) => {
            if key.nulls_first { Ordering::Greater } else { Ordering::Less }
        }
        (false, false) => {
            let ord = compare_values(a, b, false)
                .unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)));
            if key.descending { ord.reverse() } else { ord }
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn check(r: &Value, f: Value) -> bool {
        matches(&record(r.clone()), &record(f)).unwrap()
    }

    #[test]
    fn test_equality_and_operators() {
        let ada = json!({ "id": 1, "name": "Ada", "age": 36, "email": null });
        assert!(check(&ada, json!({ "name": "Ada" })));
        assert!(check(&ada, json!({ "age": 36.0 })));
        assert!(check(&ada, json!({ "age": { "gte": 30, "lt": 40 } })));
        assert!(!check(&ada, json!({ "age": { "gt": 36 } })));
        assert!(check(&ada, json!({ "id": { "in": [1, 2] } })));
        assert!(check(&ada, json!({ "id": { "notIn": [2, 3] } })));
        assert!(check(&ada, json!({ "email": null })));
        assert!(!check(&ada, json!({ "email": { "not": null } })));
        assert!(check(&ada, json!({ "name": { "not": { "startsWith": "B" } } })));
    }

    #[test]
    fn test_string_operators_and_mode() {
        let ada = json!({ "name": "Ada Lovelace" });
        assert!(check(&ada, json!({ "name": { "contains": "Love" } })));
        assert!(!check(&ada, json!({ "name": { "contains": "love" } })));
        assert!(check(&ada, json!({ "name": { "contains": "love", "mode": "insensitive" } })));
        assert!(check(&ada, json!({ "name": { "endsWith": "ace" } })));
        assert!(check(&ada, json!({ "name": { "equals": "ADA LOVELACE", "mode": "insensitive" } })));
    }

    #[test]
    fn test_logical_combinators() {
        let bob = json!({ "name": "Bob", "active": false, "age": 20 });
        assert!(check(&bob, json!({ "OR": [{ "active": true }, { "age": { "lt": 30 } }] })));
        assert!(!check(&bob, json!({ "AND": [{ "active": false }, { "name": "Eve" }] })));
        assert!(check(&bob, json!({ "NOT": { "name": "Eve" } })));
        assert!(!check(&bob, json!({ "OR": [] })));
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let err = matches(
            &record(json!({ "age": 1 })),
            &record(json!({ "age": { "gt": 0, "between": [0, 2] } })),
        )
        .unwrap_err();
        assert_eq!(err.message(), "Unknown filter operator `between` on field `age`");
    }

    #[test]
    fn test_sort_with_nulls_and_ties() {
        let mut records = vec![
            record(json!({ "id": 1, "age": 30 })),
            record(json!({ "id": 2, "age": null })),
            record(json!({ "id": 3, "age": 20 })),
            record(json!({ "id": 4, "age": 30 })),
        ];
        let keys = parse_order_by(&json!([{ "age": "asc" }, { "id": "desc" }])).unwrap();
        sort_records(&mut records, &keys);
        let ids: Vec<_> = records.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(4), json!(1), json!(2)]);

        let keys = parse_order_by(&json!({ "age": { "sort": "asc", "nulls": "first" } })).unwrap();
        sort_records(&mut records, &keys);
        assert_eq!(records[0]["id"], json!(2));
    }

    #[test]
    fn test_nested_sort_path() {
        let keys = parse_order_by(&json!({ "_count": { "id": "desc" } })).unwrap();
        assert_eq!(keys[0].path, vec!["_count".to_string(), "id".to_string()]);
        assert!(keys[0].descending);
        assert!(parse_order_by(&json!({ "id": "up" })).is_err());
    }
}
