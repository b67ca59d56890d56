//! In-process data source over JSON records.
//!
//! Records live in one table per entity, seeded from a fixture file shaped
//! like `{ "User": [ { "id": 1, ... } ] }`. Reads take the read lock; every
//! mutation holds the write lock for its whole duration, so a mutation is
//! applied completely or not at all.

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

use super::filter::{self, Record};
use super::{DataAccessError, DataSource};
use crate::error::{QuarryError, QuarryResult};
use crate::registry::{accessor_name, EntitySchema, Operation, SchemaDescription};
use crate::resolver::Arguments;

type StoreResult<T> = Result<T, DataAccessError>;

const PRIMARY_KEY: &str = "id";
const NUMBER_OPS: [&str; 5] = ["set", "increment", "decrement", "multiply", "divide"];
const AGGREGATES: [&str; 5] = ["_count", "_avg", "_sum", "_min", "_max"];

#[derive(Debug, Default)]
struct Table {
    records: Vec<Record>,
    next_id: i64,
}

impl Table {
    fn new(records: Vec<Record>) -> Self {
        let next_id = records
            .iter()
            .filter_map(|r| r.get(PRIMARY_KEY).and_then(Value::as_i64))
            .max()
            .unwrap_or(0)
            + 1;
        Self { records, next_id }
    }

    fn find_index(&self, filter: &Record) -> StoreResult<Option<usize>> {
        for (i, record) in self.records.iter().enumerate() {
            if filter::matches(record, filter)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }
}

/// JSON records held in memory.
#[derive(Debug)]
pub struct MemoryStore {
    schema: SchemaDescription,
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    /// Empty tables for every entity in `schema`.
    pub fn new(schema: SchemaDescription) -> Self {
        let tables = schema
            .entities
            .iter()
            .map(|e| (e.name.clone(), Table::default()))
            .collect();
        Self {
            schema,
            tables: RwLock::new(tables),
        }
    }

    /// Seed tables from a fixture object keyed by model name or accessor.
    pub fn with_records(schema: SchemaDescription, fixture: Map<String, Value>) -> StoreResult<Self> {
        let mut tables: HashMap<String, Table> = HashMap::new();

        for (key, value) in fixture {
            let entity = schema
                .entities
                .iter()
                .find(|e| e.name == key || accessor_name(&e.name) == key)
                .ok_or_else(|| DataAccessError::new(format!("Fixture names unknown model `{}`", key)))?;

            let Value::Array(items) = value else {
                return Err(DataAccessError::new(format!(
                    "Fixture for `{}` must be an array of records",
                    key
                )));
            };
            let records = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(record) => Ok(record),
                    _ => Err(DataAccessError::new(format!(
                        "Fixture for `{}` must contain only objects",
                        key
                    ))),
                })
                .collect::<StoreResult<Vec<_>>>()?;

            tables.insert(entity.name.clone(), Table::new(records));
        }

        for entity in &schema.entities {
            tables.entry(entity.name.clone()).or_default();
        }
        for table in tables.values_mut() {
            table.next_id = table.next_id.max(1);
        }

        Ok(Self {
            schema,
            tables: RwLock::new(tables),
        })
    }

    /// Derive a schema from a fixture: one entity per key, fields in the
    /// order they first appear.
    pub fn infer_schema(fixture: &Map<String, Value>) -> SchemaDescription {
        let entities = fixture
            .iter()
            .map(|(name, records)| {
                let mut fields: Vec<String> = Vec::new();
                for record in records.as_array().into_iter().flatten() {
                    for key in record.as_object().into_iter().flat_map(|r| r.keys()) {
                        if !fields.contains(key) {
                            fields.push(key.clone());
                        }
                    }
                }
                let mut chars = name.chars();
                let model: String = match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                };
                EntitySchema::new(model).fields(fields)
            })
            .collect();
        SchemaDescription::new(entities)
    }

    /// Build a store from fixture JSON, inferring the schema when none is
    /// given.
    pub fn from_fixture_str(schema: Option<SchemaDescription>, json: &str) -> QuarryResult<Self> {
        let fixture: Map<String, Value> = serde_json::from_str(json)
            .map_err(|e| QuarryError::Config(format!("Failed to parse fixture: {}", e)))?;
        let schema = schema.unwrap_or_else(|| Self::infer_schema(&fixture));
        Ok(Self::with_records(schema, fixture)?)
    }

    /// Open from an optional schema and an optional fixture file.
    pub fn open(schema: Option<SchemaDescription>, fixture: Option<&Path>) -> QuarryResult<Self> {
        match (schema, fixture) {
            (schema, Some(path)) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    QuarryError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                let store = Self::from_fixture_str(schema, &json)?;
                tracing::info!(
                    "Loaded {} entities from {}",
                    store.schema.entities.len(),
                    path.display()
                );
                Ok(store)
            }
            (Some(schema), None) => Ok(Self::new(schema)),
            (None, None) => Err(QuarryError::Config(
                "no data source configured: set database_url, schema_path or fixture_path"
                    .to_string(),
            )),
        }
    }

    /// Snapshot of an entity's records, in storage order.
    pub async fn records(&self, entity: &str) -> Vec<Value> {
        let tables = self.tables.read().await;
        tables
            .get(entity)
            .map(|t| t.records.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    fn entity(&self, name: &str) -> StoreResult<&EntitySchema> {
        self.schema
            .entities
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| DataAccessError::new(format!("Unknown model `{}`", name)))
    }
}

#[async_trait]
impl DataSource for MemoryStore {
    async fn describe(&self) -> Result<SchemaDescription, DataAccessError> {
        Ok(self.schema.clone())
    }

    async fn invoke(
        &self,
        entity: &str,
        operation: Operation,
        arguments: Arguments,
    ) -> Result<Value, DataAccessError> {
        let model = Model::new(self.entity(entity)?);
        if arguments.contains_key("include") {
            return Err(DataAccessError::new(
                "`include` is not supported: the memory store does not model relations",
            ));
        }

        tracing::debug!("memory {}.{}", entity, operation);

        if operation.is_mutation() {
            let mut tables = self.tables.write().await;
            let table = tables.entry(entity.to_string()).or_default();
            return model.write(operation, &arguments, table);
        }

        let tables = self.tables.read().await;
        let records = tables.get(entity).map(|t| t.records.as_slice()).unwrap_or(&[]);
        model.read(operation, &arguments, records)
    }
}

/// One entity's view of the arguments of a call.
struct Model<'a> {
    schema: &'a EntitySchema,
}

impl<'a> Model<'a> {
    fn new(schema: &'a EntitySchema) -> Self {
        Self { schema }
    }

    fn check_field(&self, field: &str, context: &str) -> StoreResult<()> {
        if self.schema.fields.is_empty() || self.schema.fields.iter().any(|f| f == field) {
            return Ok(());
        }
        Err(DataAccessError::new(format!(
            "Unknown field `{}` for {} on model `{}`",
            field, context, self.schema.name
        )))
    }

    fn read(&self, operation: Operation, args: &Arguments, records: &[Record]) -> StoreResult<Value> {
        match operation {
            Operation::FindUnique => {
                let filter = required_object(args, "where")?;
                let rows = self.filtered(Some(filter), records)?;
                match rows.first() {
                    Some(row) => self.project(row, args),
                    None => Ok(Value::Null),
                }
            }
            Operation::FindFirst => {
                let rows = self.find(args, records)?;
                match rows.first() {
                    Some(row) => self.project(row, args),
                    None => Ok(Value::Null),
                }
            }
            Operation::FindMany => {
                let rows = self.find(args, records)?;
                let projected = rows
                    .iter()
                    .map(|row| self.project(row, args))
                    .collect::<StoreResult<Vec<_>>>()?;
                Ok(Value::Array(projected))
            }
            Operation::Count => {
                let rows = self.find(args, records)?;
                match optional_object(args, "select")? {
                    None => Ok(Value::from(rows.len())),
                    Some(select) => {
                        let mut counts = Map::new();
                        for (field, flag) in select {
                            if flag != &Value::Bool(true) {
                                continue;
                            }
                            counts.insert(field.clone(), self.count_field(field, &rows)?);
                        }
                        Ok(Value::Object(counts))
                    }
                }
            }
            Operation::Aggregate => {
                let rows = self.find(args, records)?;
                Ok(Value::Object(self.aggregates(args, &rows)?))
            }
            Operation::GroupBy => self.group_by(args, records),
            other => Err(DataAccessError::new(format!("{} is not a read operation", other))),
        }
    }

    fn write(&self, operation: Operation, args: &Arguments, table: &mut Table) -> StoreResult<Value> {
        match operation {
            Operation::Create => {
                let data = required_object(args, "data")?;
                let record = self.insert(data, table)?;
                self.project(&record, args)
            }
            Operation::Update => {
                let filter = required_object(args, "where")?;
                let data = required_object(args, "data")?;
                let Some(index) = table.find_index(filter)? else {
                    return Err(DataAccessError::new("Record to update not found."));
                };
                self.update_at(index, data, table)?;
                self.project(&table.records[index], args)
            }
            Operation::Delete => {
                let filter = required_object(args, "where")?;
                let Some(index) = table.find_index(filter)? else {
                    return Err(DataAccessError::new("Record to delete does not exist."));
                };
                let removed = table.records.remove(index);
                self.project(&removed, args)
            }
            Operation::Upsert => {
                let filter = required_object(args, "where")?;
                let create = required_object(args, "create")?;
                let update = required_object(args, "update")?;
                match table.find_index(filter)? {
                    Some(index) => {
                        self.update_at(index, update, table)?;
                        self.project(&table.records[index], args)
                    }
                    None => {
                        let record = self.insert(create, table)?;
                        self.project(&record, args)
                    }
                }
            }
            other => Err(DataAccessError::new(format!("{} is not a mutation", other))),
        }
    }

    fn filtered(&self, filter: Option<&Record>, records: &[Record]) -> StoreResult<Vec<Record>> {
        let Some(filter) = filter else {
            return Ok(records.to_vec());
        };
        for field in filter::referenced_fields(filter) {
            self.check_field(field, "where")?;
        }
        let mut rows = Vec::new();
        for record in records {
            if filter::matches(record, filter)? {
                rows.push(record.clone());
            }
        }
        Ok(rows)
    }

    /// where → orderBy → distinct → cursor/skip/take.
    fn find(&self, args: &Arguments, records: &[Record]) -> StoreResult<Vec<Record>> {
        let mut rows = self.filtered(optional_object(args, "where")?, records)?;

        if let Some(order) = args.get("orderBy") {
            let keys = filter::parse_order_by(order)?;
            for key in &keys {
                self.check_field(&key.path[0], "orderBy")?;
            }
            filter::sort_records(&mut rows, &keys);
        }

        if let Some(distinct) = args.get("distinct") {
            let fields = field_list(distinct, "distinct")?;
            for field in &fields {
                self.check_field(field, "distinct")?;
            }
            let mut seen: Vec<Vec<Value>> = Vec::new();
            rows.retain(|row| {
                let key: Vec<Value> = fields
                    .iter()
                    .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
                    .collect();
                if seen.contains(&key) {
                    false
                } else {
                    seen.push(key);
                    true
                }
            });
        }

        let cursor = match optional_object(args, "cursor")? {
            Some(cursor) => match rows.iter().position(|row| {
                cursor
                    .iter()
                    .all(|(k, v)| filter::values_equal(row.get(k).unwrap_or(&Value::Null), v, false))
            }) {
                Some(position) => Some(position),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let skip = integer(args, "skip")?.unwrap_or(0);
        if skip < 0 {
            return Err(DataAccessError::new("`skip` must be a non-negative integer"));
        }
        let skip = skip as usize;
        let len = rows.len();

        let range = match integer(args, "take")? {
            Some(take) if take < 0 => {
                let end = cursor.map(|p| p + 1).unwrap_or(len).saturating_sub(skip);
                end.saturating_sub(take.unsigned_abs() as usize)..end
            }
            take => {
                let start = (cursor.unwrap_or(0) + skip).min(len);
                let end = match take {
                    Some(take) => (start + take as usize).min(len),
                    None => len,
                };
                start..end
            }
        };

        Ok(rows.drain(range).collect())
    }

    fn project(&self, record: &Record, args: &Arguments) -> StoreResult<Value> {
        let Some(select) = optional_object(args, "select")? else {
            return Ok(Value::Object(record.clone()));
        };

        for (field, flag) in select {
            self.check_field(field, "select")?;
            if !flag.is_boolean() {
                return Err(DataAccessError::new(format!(
                    "`select.{}` must be true or false",
                    field
                )));
            }
        }

        let wanted = |field: &str| select.get(field) == Some(&Value::Bool(true));
        let mut projected: Map<String, Value> = record
            .iter()
            .filter(|(k, _)| wanted(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (field, _) in select.iter().filter(|(k, _)| wanted(k.as_str())) {
            projected.entry(field.clone()).or_insert(Value::Null);
        }
        Ok(Value::Object(projected))
    }

    fn insert(&self, data: &Record, table: &mut Table) -> StoreResult<Record> {
        let mut values = Map::new();
        for (field, value) in data {
            self.check_field(field, "data")?;
            let value = match value {
                Value::Object(op) if is_number_op(op) => match op.get("set") {
                    Some(v) => v.clone(),
                    None => {
                        return Err(DataAccessError::new(format!(
                            "Only `set` can be used on `{}` when creating",
                            field
                        )));
                    }
                },
                other => other.clone(),
            };
            values.insert(field.clone(), value);
        }

        let declares_id =
            self.schema.fields.is_empty() || self.schema.fields.iter().any(|f| f == PRIMARY_KEY);
        if declares_id && !values.contains_key(PRIMARY_KEY) {
            values.insert(PRIMARY_KEY.to_string(), Value::from(table.next_id));
        }
        if let Some(id) = values.get(PRIMARY_KEY) {
            if table
                .records
                .iter()
                .any(|r| r.get(PRIMARY_KEY).is_some_and(|v| filter::values_equal(v, id, false)))
            {
                return Err(unique_violation());
            }
            if let Some(id) = id.as_i64() {
                table.next_id = table.next_id.max(id + 1);
            }
        }

        // Declared fields first, in declaration order, then anything extra.
        let mut record = Map::new();
        for field in &self.schema.fields {
            record.insert(field.clone(), values.remove(field).unwrap_or(Value::Null));
        }
        if let Some(id) = values.remove(PRIMARY_KEY) {
            record.insert(PRIMARY_KEY.to_string(), id);
        }
        record.extend(values);

        table.records.push(record.clone());
        Ok(record)
    }

    fn update_at(&self, index: usize, data: &Record, table: &mut Table) -> StoreResult<()> {
        let mut updated = table.records[index].clone();
        for (field, change) in data {
            self.check_field(field, "data")?;
            let current = updated.get(field).cloned().unwrap_or(Value::Null);
            let value = match change {
                Value::Object(op) if is_number_op(op) => {
                    let (name, operand) = op.iter().next().ok_or_else(|| {
                        DataAccessError::new(format!("Empty update for `{}`", field))
                    })?;
                    number_op(&current, name, operand, field)?
                }
                other => other.clone(),
            };
            updated.insert(field.clone(), value);
        }

        if let Some(id) = updated.get(PRIMARY_KEY) {
            let clash = table.records.iter().enumerate().any(|(i, r)| {
                i != index && r.get(PRIMARY_KEY).is_some_and(|v| filter::values_equal(v, id, false))
            });
            if clash {
                return Err(unique_violation());
            }
            if let Some(id) = id.as_i64() {
                table.next_id = table.next_id.max(id + 1);
            }
        }

        table.records[index] = updated;
        Ok(())
    }

    fn count_field(&self, field: &str, rows: &[Record]) -> StoreResult<Value> {
        if field == "_all" {
            return Ok(Value::from(rows.len()));
        }
        self.check_field(field, "_count")?;
        let n = rows
            .iter()
            .filter(|r| r.get(field).is_some_and(|v| !v.is_null()))
            .count();
        Ok(Value::from(n))
    }

    /// `_count`, `_avg`, `_sum`, `_min`, `_max` over `rows`.
    fn aggregates(&self, args: &Arguments, rows: &[Record]) -> StoreResult<Record> {
        let mut out = Map::new();
        for name in AGGREGATES {
            let Some(selection) = args.get(name) else {
                continue;
            };
            let value = match (name, selection) {
                ("_count", Value::Bool(true)) => Value::from(rows.len()),
                (_, Value::Object(fields)) => {
                    let mut values = Map::new();
                    for (field, flag) in fields {
                        if flag != &Value::Bool(true) {
                            continue;
                        }
                        let value = if name == "_count" {
                            self.count_field(field, rows)?
                        } else {
                            self.check_field(field, name)?;
                            aggregate_field(name, field, rows)?
                        };
                        values.insert(field.clone(), value);
                    }
                    Value::Object(values)
                }
                _ => {
                    return Err(DataAccessError::new(format!(
                        "`{}` expects an object of fields",
                        name
                    )));
                }
            };
            out.insert(name.to_string(), value);
        }
        Ok(out)
    }

    fn group_by(&self, args: &Arguments, records: &[Record]) -> StoreResult<Value> {
        let by = field_list(
            args.get("by")
                .ok_or_else(|| DataAccessError::new("Argument `by` is missing."))?,
            "by",
        )?;
        if by.is_empty() {
            return Err(DataAccessError::new("Argument `by` must name at least one field"));
        }
        for field in &by {
            self.check_field(field, "by")?;
        }

        let rows = self.filtered(optional_object(args, "where")?, records)?;

        let mut groups: Vec<(Vec<Value>, Vec<Record>)> = Vec::new();
        for row in rows {
            let key: Vec<Value> = by
                .iter()
                .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }

        let having = optional_object(args, "having")?;
        let mut output = Vec::new();
        for (key, members) in groups {
            let mut record: Record = by.iter().cloned().zip(key).collect();
            if let Some(having) = having {
                if !self.having_matches(&record, &members, having)? {
                    continue;
                }
            }
            record.extend(self.aggregates(args, &members)?);
            output.push(record);
        }

        if let Some(order) = args.get("orderBy") {
            filter::sort_records(&mut output, &filter::parse_order_by(order)?);
        }

        let skip = integer(args, "skip")?.unwrap_or(0).max(0) as usize;
        let take = integer(args, "take")?;
        let rows = output.into_iter().skip(skip);
        let rows: Vec<Value> = match take {
            Some(take) if take >= 0 => rows.take(take as usize).map(Value::Object).collect(),
            Some(_) => {
                return Err(DataAccessError::new("`take` must be non-negative for groupBy"));
            }
            None => rows.map(Value::Object).collect(),
        };
        Ok(Value::Array(rows))
    }

    /// `having` conditions apply to group keys or to aggregates of a field,
    /// e.g. `{ age: { _avg: { gt: 30 } } }`.
    fn having_matches(&self, group: &Record, members: &[Record], having: &Record) -> StoreResult<bool> {
        for (key, condition) in having {
            let ok = match key.as_str() {
                "AND" | "OR" | "NOT" => {
                    let nested: Vec<&Record> = match condition {
                        Value::Object(map) => vec![map],
                        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
                        _ => Vec::new(),
                    };
                    let mut results = Vec::new();
                    for h in nested {
                        results.push(self.having_matches(group, members, h)?);
                    }
                    match key.as_str() {
                        "AND" => results.iter().all(|r| *r),
                        "OR" => results.iter().any(|r| *r),
                        _ => !results.iter().any(|r| *r),
                    }
                }
                field => {
                    self.check_field(field, "having")?;
                    match condition {
                        Value::Object(map) if map.keys().any(|k| AGGREGATES.contains(&k.as_str())) => {
                            let mut all = true;
                            for (aggregate, cond) in map {
                                let value = if aggregate == "_count" {
                                    self.count_field(field, members)?
                                } else {
                                    aggregate_field(aggregate, field, members)?
                                };
                                let computed: Record =
                                    [(field.to_string(), value)].into_iter().collect();
                                let test: Record =
                                    [(field.to_string(), cond.clone())].into_iter().collect();
                                if !filter::matches(&computed, &test)? {
                                    all = false;
                                    break;
                                }
                            }
                            all
                        }
                        _ => {
                            let test: Record =
                                [(field.to_string(), condition.clone())].into_iter().collect();
                            filter::matches(group, &test)?
                        }
                    }
                }
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn unique_violation() -> DataAccessError {
    DataAccessError::new(format!(
        "Unique constraint failed on the fields: (`{}`)",
        PRIMARY_KEY
    ))
}

fn optional_object<'a>(args: &'a Arguments, name: &str) -> StoreResult<Option<&'a Record>> {
    match args.get(name) {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(DataAccessError::new(format!("Argument `{}` must be an object", name))),
    }
}

fn required_object<'a>(args: &'a Arguments, name: &str) -> StoreResult<&'a Record> {
    optional_object(args, name)?
        .ok_or_else(|| DataAccessError::new(format!("Argument `{}` is missing.", name)))
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

fn field_list(value: &Value, name: &str) -> StoreResult<Vec<String>> {
    match value {
        Value::String(field) => Ok(vec![field.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    DataAccessError::new(format!("`{}` expects field names", name))
                })
            })
            .collect(),
        _ => Err(DataAccessError::new(format!(
            "`{}` expects a field name or an array of field names",
            name
        ))),
    }
}

fn is_number_op(op: &Record) -> bool {
    op.len() == 1 && op.keys().all(|k| NUMBER_OPS.contains(&k.as_str()))
}

fn number_op(current: &Value, op: &str, operand: &Value, field: &str) -> StoreResult<Value> {
    if op == "set" {
        return Ok(operand.clone());
    }

    let (Value::Number(a), Value::Number(b)) = (current, operand) else {
        return Err(DataAccessError::new(format!(
            "Cannot {} field `{}`: both the field and the operand must be numbers",
            op, field
        )));
    };

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            "increment" => a.checked_add(b),
            "decrement" => a.checked_sub(b),
            "multiply" => a.checked_mul(b),
            _ if b == 0 => return Err(DataAccessError::new(format!("Division by zero on `{}`", field))),
            _ => a.checked_div(b),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| DataAccessError::new(format!("Numeric overflow on `{}`", field)));
    }

    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    let result = match op {
        "increment" => a + b,
        "decrement" => a - b,
        "multiply" => a * b,
        _ => a / b,
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| DataAccessError::new(format!("Result for `{}` is not a finite number", field)))
}

/// One of `_avg`, `_sum`, `_min`, `_max` for one field. Nulls are skipped;
/// no values gives null.
fn aggregate_field(aggregate: &str, field: &str, rows: &[Record]) -> StoreResult<Value> {
    let values: Vec<&Value> = rows
        .iter()
        .filter_map(|r| r.get(field))
        .filter(|v| !v.is_null())
        .collect();
    if values.is_empty() {
        return Ok(Value::Null);
    }

    match aggregate {
        "_min" | "_max" => {
            let mut best = values[0];
            for v in &values[1..] {
                let ord = filter::compare_values(v, best, false).ok_or_else(|| {
                    DataAccessError::new(format!("Cannot compare values of `{}`", field))
                })?;
                let better = if aggregate == "_min" {
                    ord.is_lt()
                } else {
                    ord.is_gt()
                };
                if better {
                    best = v;
                }
            }
            Ok(best.clone())
        }
        "_sum" | "_avg" => {
            let numbers: Vec<&Number> = values
                .iter()
                .map(|v| match v {
                    Value::Number(n) => Ok(n),
                    _ => Err(DataAccessError::new(format!(
                        "`{}` needs a numeric field, `{}` is not",
                        aggregate, field
                    ))),
                })
                .collect::<StoreResult<_>>()?;

            let float_sum: f64 = numbers.iter().filter_map(|n| n.as_f64()).sum();
            if aggregate == "_avg" {
                return Ok(Number::from_f64(float_sum / numbers.len() as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null));
            }
            let int_sum = numbers
                .iter()
                .try_fold(0i64, |acc, n| n.as_i64().and_then(|n| acc.checked_add(n)));
            Ok(match int_sum {
                Some(sum) => Value::from(sum),
                None => Number::from_f64(float_sum)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            })
        }
        other => Err(DataAccessError::new(format!("Unknown aggregate `{}`", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> MemoryStore {
        let fixture = json!({
            "User": [
                { "id": 1, "name": "Ada", "email": "ada@example.com", "age": 36, "active": true, "role": "admin" },
                { "id": 2, "name": "Bob", "email": null, "age": 24, "active": false, "role": "member" },
                { "id": 3, "name": "Cy", "email": "cy@example.com", "age": 41, "active": true, "role": "member" },
                { "id": 4, "name": "Dee", "email": "dee@example.com", "age": 29, "active": true, "role": "member" }
            ]
        });
        MemoryStore::from_fixture_str(None, &fixture.to_string()).unwrap()
    }

    fn args(value: Value) -> Arguments {
        value.as_object().unwrap().clone()
    }

    async fn call(store: &MemoryStore, op: Operation, value: Value) -> StoreResult<Value> {
        store.invoke("User", op, args(value)).await
    }

    fn ids(value: &Value) -> Vec<i64> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_inferred_schema() {
        let store = store();
        let schema = store.describe().await.unwrap();
        assert_eq!(schema.entities[0].name, "User");
        assert_eq!(
            schema.entities[0].fields,
            vec!["id", "name", "email", "age", "active", "role"]
        );
    }

    #[tokio::test]
    async fn test_find_many_where_order_take() {
        let store = store();
        let rows = call(
            &store,
            Operation::FindMany,
            json!({ "where": { "active": true }, "orderBy": { "age": "desc" }, "take": 2 }),
        )
        .await
        .unwrap();
        assert_eq!(ids(&rows), vec![3, 1]);
    }

    #[tokio::test]
    async fn test_cursor_skip_and_negative_take() {
        let store = store();
        let rows = call(&store, Operation::FindMany, json!({ "cursor": { "id": 2 }, "skip": 1 }))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec![3, 4]);

        let rows = call(&store, Operation::FindMany, json!({ "take": -2 })).await.unwrap();
        assert_eq!(ids(&rows), vec![3, 4]);

        let rows = call(&store, Operation::FindMany, json!({ "cursor": { "id": 3 }, "take": -2 }))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec![2, 3]);

        let rows = call(&store, Operation::FindMany, json!({ "cursor": { "id": 99 } }))
            .await
            .unwrap();
        assert_eq!(rows, json!([]));
    }

    #[tokio::test]
    async fn test_distinct_and_select() {
        let store = store();
        let rows = call(
            &store,
            Operation::FindMany,
            json!({ "distinct": ["role"], "select": { "role": true, "name": true } }),
        )
        .await
        .unwrap();
        assert_eq!(
            rows,
            json!([{ "name": "Ada", "role": "admin" }, { "name": "Bob", "role": "member" }])
        );

        let err = call(&store, Operation::FindMany, json!({ "select": { "password": true } }))
            .await
            .unwrap_err();
        assert_eq!(
            err.message(),
            "Unknown field `password` for select on model `User`"
        );
    }

    #[tokio::test]
    async fn test_find_unique_and_first() {
        let store = store();
        let row = call(&store, Operation::FindUnique, json!({ "where": { "id": 3 } }))
            .await
            .unwrap();
        assert_eq!(row["name"], "Cy");

        let none = call(&store, Operation::FindUnique, json!({ "where": { "id": 30 } }))
            .await
            .unwrap();
        assert_eq!(none, Value::Null);

        let err = call(&store, Operation::FindUnique, json!({})).await.unwrap_err();
        assert_eq!(err.message(), "Argument `where` is missing.");

        let row = call(&store, Operation::FindFirst, json!({ "where": { "role": "member" } }))
            .await
            .unwrap();
        assert_eq!(row["id"], 2);
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_fills_fields() {
        let store = store();
        let row = call(&store, Operation::Create, json!({ "data": { "name": "Eve", "age": 30 } }))
            .await
            .unwrap();
        assert_eq!(
            row,
            json!({ "id": 5, "name": "Eve", "email": null, "age": 30, "active": null, "role": null })
        );

        let err = call(&store, Operation::Create, json!({ "data": { "id": 5, "name": "Dup" } }))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Unique constraint failed on the fields: (`id`)");
        assert_eq!(store.records("User").await.len(), 5);
    }

    #[tokio::test]
    async fn test_update_with_number_ops() {
        let store = store();
        let row = call(
            &store,
            Operation::Update,
            json!({ "where": { "id": 2 }, "data": { "age": { "increment": 2 }, "active": true } }),
        )
        .await
        .unwrap();
        assert_eq!(row["age"], 26);
        assert_eq!(row["active"], true);

        let row = call(
            &store,
            Operation::Update,
            json!({ "where": { "id": 2 }, "data": { "age": { "divide": 4 } } }),
        )
        .await
        .unwrap();
        assert_eq!(row["age"], 6);

        let err = call(
            &store,
            Operation::Update,
            json!({ "where": { "id": 2 }, "data": { "name": { "increment": 1 } } }),
        )
        .await
        .unwrap_err();
        assert!(err.message().starts_with("Cannot increment field `name`"));

        let err = call(
            &store,
            Operation::Update,
            json!({ "where": { "id": 42 }, "data": { "age": 1 } }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "Record to update not found.");
    }

    #[tokio::test]
    async fn test_failed_update_leaves_record_untouched() {
        let store = store();
        let err = call(
            &store,
            Operation::Update,
            json!({ "where": { "id": 1 }, "data": { "age": 99, "name": { "multiply": 2 } } }),
        )
        .await;
        assert!(err.is_err());
        let row = call(&store, Operation::FindUnique, json!({ "where": { "id": 1 } }))
            .await
            .unwrap();
        assert_eq!(row["age"], 36);
    }

    #[tokio::test]
    async fn test_delete_and_upsert() {
        let store = store();
        let removed = call(&store, Operation::Delete, json!({ "where": { "id": 4 } }))
            .await
            .unwrap();
        assert_eq!(removed["name"], "Dee");

        let err = call(&store, Operation::Delete, json!({ "where": { "id": 4 } }))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Record to delete does not exist.");

        let created = call(
            &store,
            Operation::Upsert,
            json!({
                "where": { "email": "fay@example.com" },
                "create": { "name": "Fay", "email": "fay@example.com" },
                "update": { "active": true }
            }),
        )
        .await
        .unwrap();
        assert_eq!(created["id"], 5);

        let updated = call(
            &store,
            Operation::Upsert,
            json!({
                "where": { "email": "fay@example.com" },
                "create": { "name": "Fay" },
                "update": { "active": true }
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated["id"], 5);
        assert_eq!(updated["active"], true);
        assert_eq!(store.records("User").await.len(), 4);
    }

    #[tokio::test]
    async fn test_count() {
        let store = store();
        let n = call(&store, Operation::Count, json!({ "where": { "active": true } }))
            .await
            .unwrap();
        assert_eq!(n, json!(3));

        let counts = call(
            &store,
            Operation::Count,
            json!({ "select": { "_all": true, "email": true } }),
        )
        .await
        .unwrap();
        assert_eq!(counts, json!({ "_all": 4, "email": 3 }));
    }

    #[tokio::test]
    async fn test_aggregate() {
        let store = store();
        let result = call(
            &store,
            Operation::Aggregate,
            json!({
                "where": { "role": "member" },
                "_count": true,
                "_avg": { "age": true },
                "_sum": { "age": true },
                "_min": { "name": true },
                "_max": { "age": true }
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            result,
            json!({
                "_count": 3,
                "_avg": { "age": 31.333333333333332 },
                "_sum": { "age": 94 },
                "_min": { "name": "Bob" },
                "_max": { "age": 41 }
            })
        );
    }

    #[tokio::test]
    async fn test_group_by_with_having() {
        let store = store();
        let groups = call(
            &store,
            Operation::GroupBy,
            json!({
                "by": ["role"],
                "_count": { "_all": true },
                "_avg": { "age": true },
                "orderBy": { "role": "asc" }
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            groups,
            json!([
                { "role": "admin", "_count": { "_all": 1 }, "_avg": { "age": 36.0 } },
                { "role": "member", "_count": { "_all": 3 }, "_avg": { "age": 31.333333333333332 } }
            ])
        );

        let groups = call(
            &store,
            Operation::GroupBy,
            json!({ "by": "role", "having": { "age": { "_avg": { "lt": 35 } } } }),
        )
        .await
        .unwrap();
        assert_eq!(groups, json!([{ "role": "member" }]));

        let err = call(&store, Operation::GroupBy, json!({})).await.unwrap_err();
        assert_eq!(err.message(), "Argument `by` is missing.");
    }

    #[tokio::test]
    async fn test_include_rejected() {
        let store = store();
        let err = call(&store, Operation::FindMany, json!({ "include": { "posts": true } }))
            .await
            .unwrap_err();
        assert!(err.message().contains("does not model relations"));
    }

    #[test]
    fn test_open_without_anything_is_config_error() {
        let err = MemoryStore::open(None, None).unwrap_err();
        assert!(matches!(err, QuarryError::Config(_)));
    }

    #[test]
    fn test_fixture_with_unknown_model() {
        let schema = SchemaDescription::new(vec![EntitySchema::new("User")]);
        let err = MemoryStore::from_fixture_str(Some(schema), r#"{ "Ghost": [] }"#).unwrap_err();
        assert!(err.to_string().contains("unknown model `Ghost`"));
    }
}
