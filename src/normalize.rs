//! Result normalization: any raw result becomes an ordered list of rows.
//!
//! | raw result          | rows                                   |
//! |---------------------|----------------------------------------|
//! | `null`              | none, no columns                       |
//! | object              | one row                                |
//! | array               | one row per element, order preserved   |
//! | scalar              | one row with a single `value` column   |
//!
//! Columns are taken from the first row only. Keys that appear only in later
//! rows are not added; those rows simply lack cells for them.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// Column used for scalar results and scalar array elements.
pub const VALUE_COLUMN: &str = "value";

/// A renderable cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    /// Object or array; shown as its JSON text, never interpreted.
    Nested(Value),
}

impl From<&Value> for Cell {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => Cell::Number(n.clone()),
            Value::String(s) => Cell::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Cell::Nested(value.clone()),
        }
    }
}

impl Cell {
    pub fn to_value(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Number(n) => Value::Number(n.clone()),
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Nested(v) => v.clone(),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Null => serializer.serialize_unit(),
            Cell::Bool(b) => serializer.serialize_bool(*b),
            Cell::Number(n) => n.serialize(serializer),
            Cell::Text(s) => serializer.serialize_str(s),
            Cell::Nested(v) => v.serialize(serializer),
        }
    }
}

/// Ordered mapping from column name to cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRow(Vec<(String, Cell)>);

impl ResultRow {
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.0.iter().find(|(name, _)| name == column).map(|(_, c)| c)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.0.iter().map(|(name, cell)| (name.as_str(), cell))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self(
                map.iter()
                    .map(|(k, v)| (k.clone(), Cell::from(v)))
                    .collect(),
            ),
            other => Self(vec![(VALUE_COLUMN.to_string(), Cell::from(other))]),
        }
    }
}

impl Serialize for ResultRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, cell) in &self.0 {
            map.serialize_entry(name, cell)?;
        }
        map.end()
    }
}

/// Rows plus the column list derived from the first row.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Normalize a raw data-source result. Pure: same input, same output.
pub fn normalize(raw: &Value) -> ResultSet {
    let rows: Vec<ResultRow> = match raw {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(ResultRow::from_value).collect(),
        other => vec![ResultRow::from_value(other)],
    };

    let columns = rows
        .first()
        .map(|row| row.columns().map(str::to_string).collect())
        .unwrap_or_default();

    ResultSet { columns, rows }
}
