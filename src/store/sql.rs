//! SQL data source.
//!
//! Each operation compiles to parameterized SQL ([`plan`]) and runs on an sqlx
//! `Any` pool. Values from the argument tree are always bound as parameters;
//! only validated identifiers and integers are written into the SQL text.
//!
//! Supported: `where` filters, `orderBy`, `take`/`skip`, `select`,
//! create/update/delete with `RETURNING`, upsert (in a transaction), count,
//! aggregate and groupBy. `cursor`, `distinct`, negative `take` and `include`
//! are rejected.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Column, Executor, Row, TypeInfo};

use super::filter::{self, Record, SortKey};
use super::{DataAccessError, DataSource};
use crate::parser::literal::is_identifier;
use crate::registry::{EntitySchema, Operation, SchemaDescription};
use crate::resolver::Arguments;

type StoreResult<T> = Result<T, DataAccessError>;

/// SQL flavour, picked from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> StoreResult<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(DataAccessError::new(format!(
                "Unsupported database URL '{}': expected postgres:// or sqlite:",
                url.split("://").next().unwrap_or(url)
            )))
        }
    }

    fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${}", n),
            Self::Sqlite => "?".to_string(),
        }
    }

    /// Physical row identifier, used to touch exactly one row.
    fn row_id(&self) -> &'static str {
        match self {
            Self::Postgres => "ctid",
            Self::Sqlite => "rowid",
        }
    }

    fn like(&self, insensitive: bool) -> &'static str {
        match (self, insensitive) {
            (Self::Postgres, true) => "ILIKE",
            _ => "LIKE",
        }
    }

    /// Postgres returns NUMERIC for AVG/SUM, which the Any driver cannot decode.
    fn float(&self, expr: String) -> String {
        match self {
            Self::Postgres => format!("CAST({} AS DOUBLE PRECISION)", expr),
            Self::Sqlite => expr,
        }
    }
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            // Structured values are stored as JSON text.
            other => SqlValue::Text(other.to_string()),
        }
    }
}

/// SQL text plus its parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// How to turn a statement's rows into the operation's result.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// All rows as an array.
    Many(Statement),
    /// First row, or null.
    One(Statement),
    /// First row, or the given error.
    Required(Statement, &'static str),
    /// First column of the first row.
    Scalar(Statement),
    /// First row with `a.b` aliases folded into nested objects.
    Nested(Statement),
    /// Every row folded like [`Plan::Nested`].
    NestedMany(Statement),
    /// Look up, then update or create, in one transaction.
    Upsert {
        find: Statement,
        update: Statement,
        create: Statement,
    },
}

/// Double-quote an identifier after checking it is a plain name.
pub fn quote_ident(name: &str) -> StoreResult<String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DataAccessError::new(format!("Invalid identifier `{}`", name)));
    }
    Ok(format!("\"{}\"", name))
}

/// Accumulates parameters while SQL text is built left to right.
struct SqlBuilder {
    dialect: Dialect,
    table: String,
    params: Vec<SqlValue>,
}

impl SqlBuilder {
    fn new(dialect: Dialect, table: &str) -> StoreResult<Self> {
        Ok(Self {
            dialect,
            table: quote_ident(table)?,
            params: Vec::new(),
        })
    }

    fn bind(&mut self, value: &Value) -> String {
        self.params.push(SqlValue::from(value));
        self.dialect.placeholder(self.params.len())
    }

    /// NULL is written literally so the column decides its type.
    fn value(&mut self, value: &Value) -> String {
        if value.is_null() {
            "NULL".to_string()
        } else {
            self.bind(value)
        }
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }

    fn filter(&mut self, filter: &Record) -> StoreResult<String> {
        let mut parts = Vec::new();
        for (key, condition) in filter {
            match key.as_str() {
                "AND" | "OR" | "NOT" => {
                    let nested = nested_filters(condition, key)?;
                    let fragments = nested
                        .into_iter()
                        .map(|f| self.filter(f))
                        .collect::<StoreResult<Vec<_>>>()?;
                    parts.push(match (key.as_str(), fragments.is_empty()) {
                        ("AND", true) | ("NOT", true) => "1=1".to_string(),
                        ("OR", true) => "1=0".to_string(),
                        ("AND", false) => format!("({})", fragments.join(" AND ")),
                        ("OR", false) => format!("({})", fragments.join(" OR ")),
                        _ => format!("NOT ({})", fragments.join(" OR ")),
                    });
                }
                field => {
                    let column = quote_ident(field)?;
                    parts.push(self.condition(&column, field, condition)?);
                }
            }
        }
        Ok(if parts.is_empty() {
            "1=1".to_string()
        } else {
            parts.join(" AND ")
        })
    }

    fn condition(&mut self, column: &str, field: &str, condition: &Value) -> StoreResult<String> {
        let ops = match condition {
            Value::Object(ops) if filter::is_condition(condition) => ops,
            other => return Ok(self.equals(column, other, false)),
        };

        let insensitive = ops.get("mode").and_then(Value::as_str) == Some("insensitive");
        let mut parts = Vec::new();
        for (op, expected) in ops {
            let fragment = match op.as_str() {
                "mode" => continue,
                "equals" => self.equals(column, expected, insensitive),
                "not" if filter::is_condition(expected) => {
                    format!("NOT ({})", self.condition(column, field, expected)?)
                }
                "not" if expected.is_null() => format!("{} IS NOT NULL", column),
                "not" => format!("({c} IS NULL OR NOT ({}))", self.equals(column, expected, insensitive), c = column),
                "in" | "notIn" => {
                    let Value::Array(list) = expected else {
                        return Err(DataAccessError::new(format!(
                            "`{}` on field `{}` expects an array",
                            op, field
                        )));
                    };
                    match (op.as_str(), list.is_empty()) {
                        ("in", true) => "1=0".to_string(),
                        (_, true) => "1=1".to_string(),
                        (op, false) => {
                            let placeholders: Vec<String> = list.iter().map(|v| self.bind(v)).collect();
                            let keyword = if op == "in" { "IN" } else { "NOT IN" };
                            format!("{} {} ({})", column, keyword, placeholders.join(", "))
                        }
                    }
                }
                "lt" | "lte" | "gt" | "gte" => {
                    let symbol = match op.as_str() {
                        "lt" => "<",
                        "lte" => "<=",
                        "gt" => ">",
                        _ => ">=",
                    };
                    format!("{} {} {}", column, symbol, self.bind(expected))
                }
                "contains" | "startsWith" | "endsWith" => {
                    let Value::String(needle) = expected else {
                        return Err(DataAccessError::new(format!(
                            "`{}` on field `{}` expects a string",
                            op, field
                        )));
                    };
                    let escaped = escape_like(needle);
                    let pattern = match op.as_str() {
                        "contains" => format!("%{}%", escaped),
                        "startsWith" => format!("{}%", escaped),
                        _ => format!("%{}", escaped),
                    };
                    format!(
                        "{} {} {} ESCAPE '\\'",
                        column,
                        self.dialect.like(insensitive),
                        self.bind(&Value::String(pattern))
                    )
                }
                other => {
                    return Err(DataAccessError::new(format!(
                        "Unknown filter operator `{}` on field `{}`",
                        other, field
                    )));
                }
            };
            parts.push(fragment);
        }

        Ok(match parts.len() {
            0 => "1=1".to_string(),
            1 => parts.remove(0),
            _ => format!("({})", parts.join(" AND ")),
        })
    }

    fn equals(&mut self, column: &str, value: &Value, insensitive: bool) -> String {
        match value {
            Value::Null => format!("{} IS NULL", column),
            Value::String(_) if insensitive => {
                format!("LOWER({}) = LOWER({})", column, self.bind(value))
            }
            _ => format!("{} = {}", column, self.bind(value)),
        }
    }

    fn where_clause(&mut self, args: &Arguments) -> StoreResult<String> {
        match object(args, "where")? {
            Some(filter) => Ok(format!(" WHERE {}", self.filter(filter)?)),
            None => Ok(String::new()),
        }
    }

    /// `WHERE <row id> IN (first row matching where)`.
    fn single_row(&mut self, filter: &Record) -> StoreResult<String> {
        let condition = self.filter(filter)?;
        let row_id = self.dialect.row_id();
        Ok(format!(
            " WHERE {row_id} IN (SELECT {row_id} FROM {} WHERE {} LIMIT 1)",
            self.table, condition
        ))
    }

    fn order_by(&self, args: &Arguments) -> StoreResult<String> {
        let Some(order) = args.get("orderBy") else {
            return Ok(String::new());
        };
        let keys = filter::parse_order_by(order)?;
        let terms = keys
            .iter()
            .map(|key| self.sort_term(key))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(format!(" ORDER BY {}", terms.join(", ")))
    }

    fn sort_term(&self, key: &SortKey) -> StoreResult<String> {
        let expr = match key.path.as_slice() {
            [field] => quote_ident(field)?,
            [aggregate, field] => self.aggregate_expr(aggregate, field)?,
            _ => {
                return Err(DataAccessError::new(format!(
                    "Cannot sort by `{}`",
                    key.path.join(".")
                )));
            }
        };
        Ok(format!(
            "{} {} NULLS {}",
            expr,
            if key.descending { "DESC" } else { "ASC" },
            if key.nulls_first { "FIRST" } else { "LAST" }
        ))
    }

    fn limit(&self, args: &Arguments) -> StoreResult<String> {
        let take = integer(args, "take")?;
        let skip = integer(args, "skip")?;
        if take.is_some_and(|t| t < 0) {
            return Err(DataAccessError::new("Negative `take` is not supported by the SQL store"));
        }
        if skip.is_some_and(|s| s < 0) {
            return Err(DataAccessError::new("`skip` must be a non-negative integer"));
        }
        Ok(match (take, skip) {
            (None, None) => String::new(),
            (Some(take), None) => format!(" LIMIT {}", take),
            (Some(take), Some(skip)) => format!(" LIMIT {} OFFSET {}", take, skip),
            (None, Some(skip)) => match self.dialect {
                Dialect::Sqlite => format!(" LIMIT -1 OFFSET {}", skip),
                Dialect::Postgres => format!(" OFFSET {}", skip),
            },
        })
    }

    fn aggregate_expr(&self, aggregate: &str, field: &str) -> StoreResult<String> {
        let column = if aggregate == "_count" && field == "_all" {
            "*".to_string()
        } else {
            quote_ident(field)?
        };
        Ok(match aggregate {
            "_count" => format!("COUNT({})", column),
            "_avg" => self.dialect.float(format!("AVG({})", column)),
            "_sum" => self.dialect.float(format!("SUM({})", column)),
            "_min" => format!("MIN({})", column),
            "_max" => format!("MAX({})", column),
            other => {
                return Err(DataAccessError::new(format!("Unknown aggregate `{}`", other)));
            }
        })
    }

    /// `_count`, `_avg`, … as `expr AS "_avg.field"` select items.
    fn aggregate_columns(&self, args: &Arguments) -> StoreResult<Vec<String>> {
        let mut columns = Vec::new();
        for aggregate in ["_count", "_avg", "_sum", "_min", "_max"] {
            match args.get(aggregate) {
                None => {}
                Some(Value::Bool(true)) if aggregate == "_count" => {
                    columns.push("COUNT(*) AS \"_count\"".to_string());
                }
                Some(Value::Object(fields)) => {
                    for (field, flag) in fields {
                        if flag == &Value::Bool(true) {
                            columns.push(format!(
                                "{} AS \"{}.{}\"",
                                self.aggregate_expr(aggregate, field)?,
                                aggregate,
                                field
                            ));
                        }
                    }
                }
                Some(_) => {
                    return Err(DataAccessError::new(format!(
                        "`{}` expects an object of fields",
                        aggregate
                    )));
                }
            }
        }
        Ok(columns)
    }

    fn having(&mut self, having: &Record) -> StoreResult<String> {
        let mut parts = Vec::new();
        for (key, condition) in having {
            match key.as_str() {
                "AND" | "OR" | "NOT" => {
                    let fragments = nested_filters(condition, key)?
                        .into_iter()
                        .map(|h| self.having(h))
                        .collect::<StoreResult<Vec<_>>>()?;
                    if fragments.is_empty() {
                        continue;
                    }
                    parts.push(match key.as_str() {
                        "AND" => format!("({})", fragments.join(" AND ")),
                        "OR" => format!("({})", fragments.join(" OR ")),
                        _ => format!("NOT ({})", fragments.join(" OR ")),
                    });
                }
                field => match condition {
                    Value::Object(map) if map.keys().any(|k| k.starts_with('_')) => {
                        for (aggregate, cond) in map {
                            let expr = self.aggregate_expr(aggregate, field)?;
                            parts.push(self.condition(&expr, field, cond)?);
                        }
                    }
                    other => {
                        let column = quote_ident(field)?;
                        parts.push(self.condition(&column, field, other)?);
                    }
                },
            }
        }
        Ok(parts.join(" AND "))
    }

    fn assignments(&mut self, data: &Record) -> StoreResult<Vec<String>> {
        let mut sets = Vec::new();
        for (field, change) in data {
            let column = quote_ident(field)?;
            let assignment = match change {
                Value::Object(op) if is_number_op(op) => {
                    let (name, operand) = op.iter().next().ok_or_else(|| {
                        DataAccessError::new(format!("Empty update for `{}`", field))
                    })?;
                    let symbol = match name.as_str() {
                        "set" => {
                            sets.push(format!("{} = {}", column, self.value(operand)));
                            continue;
                        }
                        "increment" => "+",
                        "decrement" => "-",
                        "multiply" => "*",
                        _ => "/",
                    };
                    format!("{c} = {c} {} {}", symbol, self.bind(operand), c = column)
                }
                other => format!("{} = {}", column, self.value(other)),
            };
            sets.push(assignment);
        }
        if sets.is_empty() {
            return Err(DataAccessError::new("Argument `data` must not be empty"));
        }
        Ok(sets)
    }

    fn insert(mut self, data: &Record, returning: &str) -> StoreResult<Statement> {
        if data.is_empty() {
            let sql = format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", self.table, returning);
            return Ok(self.finish(sql));
        }
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (field, value) in data {
            columns.push(quote_ident(field)?);
            let value = match value {
                Value::Object(op) if is_number_op(op) => op.get("set").cloned().ok_or_else(|| {
                    DataAccessError::new(format!("Only `set` can be used on `{}` when creating", field))
                })?,
                other => other.clone(),
            };
            values.push(self.value(&value));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            self.table,
            columns.join(", "),
            values.join(", "),
            returning
        );
        Ok(self.finish(sql))
    }

    fn update(mut self, filter: &Record, data: &Record, returning: &str) -> StoreResult<Statement> {
        let sets = self.assignments(data)?;
        let target = self.single_row(filter)?;
        let sql = format!(
            "UPDATE {} SET {}{} RETURNING {}",
            self.table,
            sets.join(", "),
            target,
            returning
        );
        Ok(self.finish(sql))
    }
}

/// Compile one operation on `table`.
pub fn plan(dialect: Dialect, table: &str, operation: Operation, args: &Arguments) -> StoreResult<Plan> {
    for option in ["include", "cursor", "distinct"] {
        if args.contains_key(option) {
            return Err(DataAccessError::new(format!(
                "`{}` is not supported by the SQL store",
                option
            )));
        }
    }

    let mut b = SqlBuilder::new(dialect, table)?;
    let columns = select_list(args)?;

    let plan = match operation {
        Operation::FindUnique => {
            let filter = required(args, "where")?;
            let condition = b.filter(filter)?;
            let sql = format!("SELECT {} FROM {} WHERE {} LIMIT 1", columns, b.table, condition);
            Plan::One(b.finish(sql))
        }
        Operation::FindFirst | Operation::FindMany => {
            let condition = b.where_clause(args)?;
            let order = b.order_by(args)?;
            let limit = if operation == Operation::FindFirst {
                let skip = integer(args, "skip")?.unwrap_or(0).max(0);
                format!(" LIMIT 1 OFFSET {}", skip)
            } else {
                b.limit(args)?
            };
            let sql = format!("SELECT {} FROM {}{}{}{}", columns, b.table, condition, order, limit);
            if operation == Operation::FindFirst {
                Plan::One(b.finish(sql))
            } else {
                Plan::Many(b.finish(sql))
            }
        }
        Operation::Count => {
            let inner = inner_select(&mut b, args)?;
            match object(args, "select")? {
                None => Plan::Scalar(b.finish(format!("SELECT COUNT(*) AS \"count\" FROM ({}) AS \"sub\"", inner))),
                Some(select) => {
                    let mut counts = Vec::new();
                    for (field, flag) in select {
                        if flag == &Value::Bool(true) {
                            counts.push(format!(
                                "{} AS {}",
                                b.aggregate_expr("_count", field)?,
                                quote_ident(field)?
                            ));
                        }
                    }
                    if counts.is_empty() {
                        return Err(DataAccessError::new("`select` must name at least one field to count"));
                    }
                    Plan::Nested(b.finish(format!("SELECT {} FROM ({}) AS \"sub\"", counts.join(", "), inner)))
                }
            }
        }
        Operation::Aggregate => {
            let aggregates = b.aggregate_columns(args)?;
            if aggregates.is_empty() {
                return Err(DataAccessError::new(
                    "aggregate needs at least one of `_count`, `_avg`, `_sum`, `_min`, `_max`",
                ));
            }
            let inner = inner_select(&mut b, args)?;
            Plan::Nested(b.finish(format!("SELECT {} FROM ({}) AS \"sub\"", aggregates.join(", "), inner)))
        }
        Operation::GroupBy => {
            let by = match args.get("by") {
                Some(Value::String(field)) => vec![field.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| DataAccessError::new("`by` expects field names"))
                    })
                    .collect::<StoreResult<Vec<_>>>()?,
                Some(_) => return Err(DataAccessError::new("`by` expects field names")),
                None => return Err(DataAccessError::new("Argument `by` is missing.")),
            };
            if by.is_empty() {
                return Err(DataAccessError::new("Argument `by` must name at least one field"));
            }
            let group = by
                .iter()
                .map(|f| quote_ident(f))
                .collect::<StoreResult<Vec<_>>>()?
                .join(", ");

            let mut items = vec![group.clone()];
            items.extend(b.aggregate_columns(args)?);
            let condition = b.where_clause(args)?;
            let having = match object(args, "having")? {
                Some(having) => {
                    let clause = b.having(having)?;
                    if clause.is_empty() {
                        String::new()
                    } else {
                        format!(" HAVING {}", clause)
                    }
                }
                None => String::new(),
            };
            let order = b.order_by(args)?;
            let limit = b.limit(args)?;
            let sql = format!(
                "SELECT {} FROM {}{} GROUP BY {}{}{}{}",
                items.join(", "),
                b.table,
                condition,
                group,
                having,
                order,
                limit
            );
            Plan::NestedMany(b.finish(sql))
        }
        Operation::Create => Plan::One(b.insert(required(args, "data")?, &columns)?),
        Operation::Update => Plan::Required(
            b.update(required(args, "where")?, required(args, "data")?, &columns)?,
            "Record to update not found.",
        ),
        Operation::Delete => {
            let target = b.single_row(required(args, "where")?)?;
            let sql = format!("DELETE FROM {}{} RETURNING {}", b.table, target, columns);
            Plan::Required(b.finish(sql), "Record to delete does not exist.")
        }
        Operation::Upsert => {
            let filter = required(args, "where")?;
            let condition = b.filter(filter)?;
            let find = b.finish(format!(
                "SELECT 1 AS \"found\" FROM {} WHERE {} LIMIT 1",
                quote_ident(table)?,
                condition
            ));
            let update = SqlBuilder::new(dialect, table)?.update(filter, required(args, "update")?, &columns)?;
            let create = SqlBuilder::new(dialect, table)?.insert(required(args, "create")?, &columns)?;
            Plan::Upsert { find, update, create }
        }
    };

    Ok(plan)
}

/// `SELECT * FROM t WHERE … ORDER BY … LIMIT …` for count and aggregate.
fn inner_select(b: &mut SqlBuilder, args: &Arguments) -> StoreResult<String> {
    let condition = b.where_clause(args)?;
    let order = b.order_by(args)?;
    let limit = b.limit(args)?;
    Ok(format!("SELECT * FROM {}{}{}{}", b.table, condition, order, limit))
}

fn select_list(args: &Arguments) -> StoreResult<String> {
    let Some(select) = object(args, "select")? else {
        return Ok("*".to_string());
    };
    let fields = select
        .iter()
        .filter(|(_, flag)| **flag == Value::Bool(true))
        .map(|(field, _)| quote_ident(field))
        .collect::<StoreResult<Vec<_>>>()?;
    if fields.is_empty() {
        return Err(DataAccessError::new("`select` must name at least one field"));
    }
    Ok(fields.join(", "))
}

fn nested_filters<'a>(value: &'a Value, name: &str) -> StoreResult<Vec<&'a Record>> {
    match value {
        Value::Object(map) => Ok(vec![map]),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_object()
                    .ok_or_else(|| DataAccessError::new(format!("`{}` expects filter objects", name)))
            })
            .collect(),
        _ => Err(DataAccessError::new(format!(
            "`{}` expects an object or an array of objects",
            name
        ))),
    }
}

fn object<'a>(args: &'a Arguments, name: &str) -> StoreResult<Option<&'a Record>> {
    match args.get(name) {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(DataAccessError::new(format!("Argument `{}` must be an object", name))),
    }
}

fn required<'a>(args: &'a Arguments, name: &str) -> StoreResult<&'a Record> {
    object(args, name)?.ok_or_else(|| DataAccessError::new(format!("Argument `{}` is missing.", name)))
}

fn integer(args: &Arguments, name: &str) -> StoreResult<Option<i64>> {
    match args.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| DataAccessError::new(format!("Argument `{}` must be an integer", name))),
    }
}

fn is_number_op(op: &Record) -> bool {
    op.len() == 1
        && op
            .keys()
            .all(|k| matches!(k.as_str(), "set" | "increment" | "decrement" | "multiply" | "divide"))
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Fold `"_avg.age"` style keys into `{ "_avg": { "age": … } }`.
fn fold_aliases(row: Record) -> Record {
    let mut out = Map::new();
    for (key, value) in row {
        match key.split_once('.') {
            Some((outer, inner)) => {
                let entry = out
                    .entry(outer.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(map) = entry {
                    map.insert(inner.to_string(), value);
                }
            }
            None => {
                out.insert(key, value);
            }
        }
    }
    out
}

/// Convert an AnyRow to a JSON object, keeping column order.
fn row_to_map(row: &AnyRow) -> Record {
    let mut map = Map::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();

        let value: Value = match type_name {
            "BOOL" | "BOOLEAN" => row
                .try_get::<bool, _>(i)
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            "INT2" | "INT4" | "INT8" | "INTEGER" | "BIGINT" | "SMALLINT" => row
                .try_get::<i64, _>(i)
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),
            "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" => row
                .try_get::<f64, _>(i)
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<String, _>(i)
                .map(Value::String)
                .unwrap_or(Value::Null),
        };

        map.insert(name, value);
    }

    map
}

async fn fetch<'c, E>(executor: E, statement: &Statement) -> StoreResult<Vec<Record>>
where
    E: Executor<'c, Database = Any>,
{
    let mut query = sqlx::query(&statement.sql);
    for param in &statement.params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
        };
    }

    let rows: Vec<AnyRow> = query
        .fetch_all(executor)
        .await
        .map_err(|e| DataAccessError::new(e.to_string()))?;
    Ok(rows.iter().map(row_to_map).collect())
}

/// A database reached through sqlx.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
    schema: SchemaDescription,
}

impl SqlStore {
    /// Connect and, when no schema is given, read one from the database.
    pub async fn connect(url: &str, schema: Option<SchemaDescription>) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_url(url)?;

        // Every connection to an in-memory SQLite database is a new database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DataAccessError::new(e.to_string()))?;

        let schema = match schema {
            Some(schema) => schema,
            None => introspect(&pool, dialect).await?,
        };
        tracing::info!("Connected to {:?} database ({} tables)", dialect, schema.entities.len());

        Ok(Self {
            pool,
            dialect,
            schema,
        })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn run(&self, plan: Plan) -> StoreResult<Value> {
        match plan {
            Plan::Many(statement) => {
                let rows = fetch(&self.pool, &statement).await?;
                Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
            }
            Plan::One(statement) => {
                let rows = fetch(&self.pool, &statement).await?;
                Ok(rows.into_iter().next().map(Value::Object).unwrap_or(Value::Null))
            }
            Plan::Required(statement, missing) => {
                let rows = fetch(&self.pool, &statement).await?;
                rows.into_iter()
                    .next()
                    .map(Value::Object)
                    .ok_or_else(|| DataAccessError::new(missing))
            }
            Plan::Scalar(statement) => {
                let rows = fetch(&self.pool, &statement).await?;
                Ok(rows
                    .into_iter()
                    .next()
                    .and_then(|row| row.into_iter().next())
                    .map(|(_, v)| v)
                    .unwrap_or(Value::Null))
            }
            Plan::Nested(statement) => {
                let rows = fetch(&self.pool, &statement).await?;
                Ok(rows
                    .into_iter()
                    .next()
                    .map(|row| Value::Object(fold_aliases(row)))
                    .unwrap_or(Value::Null))
            }
            Plan::NestedMany(statement) => {
                let rows = fetch(&self.pool, &statement).await?;
                Ok(Value::Array(
                    rows.into_iter()
                        .map(|row| Value::Object(fold_aliases(row)))
                        .collect(),
                ))
            }
            Plan::Upsert {
                find,
                update,
                create,
            } => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| DataAccessError::new(e.to_string()))?;
                let found = !fetch(&mut *tx, &find).await?.is_empty();
                let statement = if found { &update } else { &create };
                let row = fetch(&mut *tx, statement).await?.into_iter().next();
                tx.commit()
                    .await
                    .map_err(|e| DataAccessError::new(e.to_string()))?;
                Ok(row.map(Value::Object).unwrap_or(Value::Null))
            }
        }
    }
}

async fn introspect(pool: &AnyPool, dialect: Dialect) -> StoreResult<SchemaDescription> {
    let sql = match dialect {
        Dialect::Postgres => {
            "SELECT CAST(table_name AS TEXT) AS table_name, CAST(column_name AS TEXT) AS column_name \
             FROM information_schema.columns WHERE table_schema = 'public' \
             ORDER BY table_name, ordinal_position"
        }
        Dialect::Sqlite => {
            "SELECT m.name AS table_name, p.name AS column_name \
             FROM sqlite_master m JOIN pragma_table_info(m.name) p \
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' \
             ORDER BY m.name, p.cid"
        }
    };
    let rows = fetch(
        pool,
        &Statement {
            sql: sql.to_string(),
            params: Vec::new(),
        },
    )
    .await?;

    let mut entities: Vec<EntitySchema> = Vec::new();
    for row in rows {
        let (Some(Value::String(table)), Some(Value::String(column))) =
            (row.get("table_name"), row.get("column_name"))
        else {
            continue;
        };
        match entities.iter_mut().find(|e| e.table.as_deref() == Some(table.as_str())) {
            Some(entity) => entity.fields.push(column.clone()),
            None => {
                let mut entity = EntitySchema::new(model_name(table)).fields([column.clone()]);
                entity.table = Some(table.clone());
                entities.push(entity);
            }
        }
    }
    entities.retain(|entity| {
        let queryable = is_identifier(&entity.name);
        if !queryable {
            tracing::warn!(
                "Skipping table '{}': '{}' cannot be used as an entity name",
                entity.table.as_deref().unwrap_or_default(),
                entity.name
            );
        }
        queryable
    });
    Ok(SchemaDescription::new(entities))
}

/// `blog_posts` → `BlogPosts`.
fn model_name(table: &str) -> String {
    table
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[async_trait]
impl DataSource for SqlStore {
    async fn describe(&self) -> Result<SchemaDescription, DataAccessError> {
        Ok(self.schema.clone())
    }

    async fn invoke(
        &self,
        entity: &str,
        operation: Operation,
        arguments: Arguments,
    ) -> Result<Value, DataAccessError> {
        let table = self
            .schema
            .entities
            .iter()
            .find(|e| e.name == entity)
            .map(|e| e.table.clone().unwrap_or_else(|| e.name.clone()))
            .ok_or_else(|| DataAccessError::new(format!("Unknown model `{}`", entity)))?;

        let plan = plan(self.dialect, &table, operation, &arguments)?;
        tracing::debug!("sql {}.{}: {:?}", entity, operation, plan);
        self.run(plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args(value: Value) -> Arguments {
        value.as_object().unwrap().clone()
    }

    fn statement(plan: Plan) -> Statement {
        match plan {
            Plan::Many(s)
            | Plan::One(s)
            | Plan::Required(s, _)
            | Plan::Scalar(s)
            | Plan::Nested(s)
            | Plan::NestedMany(s) => s,
            Plan::Upsert { find, .. } => find,
        }
    }

    #[test]
    fn test_find_many_postgres() {
        let plan = plan(
            Dialect::Postgres,
            "users",
            Operation::FindMany,
            &args(json!({
                "where": { "active": true, "age": { "gte": 18 } },
                "orderBy": { "name": "asc" },
                "take": 10,
                "skip": 20
            })),
        )
        .unwrap();
        let s = statement(plan);
        assert_eq!(
            s.sql,
            "SELECT * FROM \"users\" WHERE \"active\" = $1 AND \"age\" >= $2 \
             ORDER BY \"name\" ASC NULLS LAST LIMIT 10 OFFSET 20"
        );
        assert_eq!(s.params, vec![SqlValue::Bool(true), SqlValue::Int(18)]);
    }

    #[test]
    fn test_sqlite_placeholders_and_logic() {
        let s = statement(
            plan(
                Dialect::Sqlite,
                "users",
                Operation::FindFirst,
                &args(json!({
                    "where": {
                        "OR": [{ "email": null }, { "name": { "contains": "50%", "mode": "insensitive" } }],
                        "id": { "in": [1, 2] }
                    },
                    "select": { "id": true, "name": true }
                })),
            )
            .unwrap(),
        );
        assert_eq!(
            s.sql,
            "SELECT \"id\", \"name\" FROM \"users\" WHERE (\"email\" IS NULL OR \"name\" LIKE ? ESCAPE '\\') \
             AND \"id\" IN (?, ?) LIMIT 1 OFFSET 0"
        );
        assert_eq!(
            s.params,
            vec![
                SqlValue::Text("%50\\%%".into()),
                SqlValue::Int(1),
                SqlValue::Int(2)
            ]
        );
    }

    #[test]
    fn test_update_touches_one_row() {
        let s = statement(
            plan(
                Dialect::Postgres,
                "users",
                Operation::Update,
                &args(json!({
                    "where": { "id": 7 },
                    "data": { "visits": { "increment": 1 }, "nickname": null }
                })),
            )
            .unwrap(),
        );
        assert_eq!(
            s.sql,
            "UPDATE \"users\" SET \"visits\" = \"visits\" + $1, \"nickname\" = NULL \
             WHERE ctid IN (SELECT ctid FROM \"users\" WHERE \"id\" = $2 LIMIT 1) RETURNING *"
        );
        assert_eq!(s.params, vec![SqlValue::Int(1), SqlValue::Int(7)]);
    }

    #[test]
    fn test_group_by_with_having() {
        let s = statement(
            plan(
                Dialect::Postgres,
                "users",
                Operation::GroupBy,
                &args(json!({
                    "by": ["role"],
                    "_count": { "_all": true },
                    "having": { "age": { "_avg": { "gt": 30 } } },
                    "orderBy": { "_count": { "role": "desc" } }
                })),
            )
            .unwrap(),
        );
        assert_eq!(
            s.sql,
            "SELECT \"role\", COUNT(*) AS \"_count._all\" FROM \"users\" GROUP BY \"role\" \
             HAVING CAST(AVG(\"age\") AS DOUBLE PRECISION) > $1 \
             ORDER BY COUNT(\"role\") DESC NULLS FIRST"
        );
    }

    #[test]
    fn test_count_with_take() {
        let s = statement(
            plan(
                Dialect::Sqlite,
                "users",
                Operation::Count,
                &args(json!({ "where": { "active": true }, "skip": 5 })),
            )
            .unwrap(),
        );
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) AS \"count\" FROM (SELECT * FROM \"users\" WHERE \"active\" = ? LIMIT -1 OFFSET 5) AS \"sub\""
        );
    }

    #[test]
    fn test_rejections() {
        let err = plan(Dialect::Sqlite, "users", Operation::FindMany, &args(json!({ "cursor": { "id": 1 } })))
            .unwrap_err();
        assert_eq!(err.message(), "`cursor` is not supported by the SQL store");

        let err = plan(
            Dialect::Sqlite,
            "users",
            Operation::FindMany,
            &args(json!({ "where": { "na me": 1 } })),
        )
        .unwrap_err();
        assert_eq!(err.message(), "Invalid identifier `na me`");

        assert!(plan(Dialect::Sqlite, "users", Operation::Delete, &args(json!({}))).is_err());
        assert!(Dialect::from_url("mysql://localhost/db").is_err());
    }

    #[test]
    fn test_fold_aliases() {
        let row = args(json!({ "_count": 3, "_avg.age": 30.5, "_sum.age": 61 }));
        assert_eq!(
            Value::Object(fold_aliases(row)),
            json!({ "_count": 3, "_avg": { "age": 30.5 }, "_sum": { "age": 61 } })
        );
        assert_eq!(model_name("blog_posts"), "BlogPosts");
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let store = SqlStore::connect("sqlite::memory:", None).await.unwrap();
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)")
            .execute(store.pool())
            .await
            .unwrap();
        let mut user = EntitySchema::new("User").fields(["id", "name", "age"]);
        user.table = Some("users".into());
        let store = SqlStore {
            schema: SchemaDescription::new(vec![user]),
            ..store
        };

        for (name, age) in [("Ada", 36), ("Bob", 24)] {
            store
                .invoke("User", Operation::Create, args(json!({ "data": { "name": name, "age": age } })))
                .await
                .unwrap();
        }

        let rows = store
            .invoke(
                "User",
                Operation::FindMany,
                args(json!({ "where": { "age": { "gt": 30 } } })),
            )
            .await
            .unwrap();
        assert_eq!(rows, json!([{ "id": 1, "name": "Ada", "age": 36 }]));

        let updated = store
            .invoke(
                "User",
                Operation::Update,
                args(json!({ "where": { "name": "Bob" }, "data": { "age": { "increment": 1 } } })),
            )
            .await
            .unwrap();
        assert_eq!(updated["age"], 25);

        let count = store.invoke("User", Operation::Count, args(json!({}))).await.unwrap();
        assert_eq!(count, json!(2));

        let err = store
            .invoke("User", Operation::Delete, args(json!({ "where": { "id": 99 } })))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Record to delete does not exist.");
    }
}
