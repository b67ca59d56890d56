//! Entity registry: the fixed set of entities, operations and options a query
//! may name.
//!
//! The registry is built once from the data source's [`SchemaDescription`] and
//! shared read-only (behind an `Arc`) by every request afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use strsim::levenshtein;

use crate::error::{QuarryError, QuarryResult};
use crate::parser::literal::is_identifier;

/// A data-access verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    FindUnique,
    FindFirst,
    FindMany,
    Create,
    Update,
    Delete,
    Upsert,
    Count,
    Aggregate,
    GroupBy,
}

impl Operation {
    pub const ALL: [Operation; 10] = [
        Operation::FindUnique,
        Operation::FindFirst,
        Operation::FindMany,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::Upsert,
        Operation::Count,
        Operation::Aggregate,
        Operation::GroupBy,
    ];

    /// Method name as written in a query.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindUnique => "findUnique",
            Self::FindFirst => "findFirst",
            Self::FindMany => "findMany",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Upsert => "upsert",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "groupBy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Mutating operations have real effects on the store.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::Delete | Self::Upsert
        )
    }

    /// Recognized top-level options and the value kind each one expects.
    pub fn options(&self) -> &'static [(QueryOption, ValueKind)] {
        use QueryOption::*;
        use ValueKind::*;

        const FIND_UNIQUE: &[(QueryOption, ValueKind)] =
            &[(Where, Object), (Select, Object), (Include, Object)];
        const FIND: &[(QueryOption, ValueKind)] = &[
            (Where, Object),
            (OrderBy, ObjectOrArray),
            (Select, Object),
            (Include, Object),
            (Take, Integer),
            (Skip, Integer),
            (Distinct, Fields),
            (Cursor, Object),
        ];
        const CREATE: &[(QueryOption, ValueKind)] =
            &[(Data, Object), (Select, Object), (Include, Object)];
        const UPDATE: &[(QueryOption, ValueKind)] = &[
            (Where, Object),
            (Data, Object),
            (Select, Object),
            (Include, Object),
        ];
        const DELETE: &[(QueryOption, ValueKind)] =
            &[(Where, Object), (Select, Object), (Include, Object)];
        const UPSERT: &[(QueryOption, ValueKind)] = &[
            (Where, Object),
            (QueryOption::Create, Object),
            (QueryOption::Update, Object),
            (Select, Object),
            (Include, Object),
        ];
        const COUNT: &[(QueryOption, ValueKind)] = &[
            (Where, Object),
            (OrderBy, ObjectOrArray),
            (Take, Integer),
            (Skip, Integer),
            (Cursor, Object),
            (Select, Object),
            (Distinct, Fields),
        ];
        const AGGREGATE: &[(QueryOption, ValueKind)] = &[
            (Where, Object),
            (OrderBy, ObjectOrArray),
            (Take, Integer),
            (Skip, Integer),
            (Cursor, Object),
            (CountAggregate, FlagOrObject),
            (Avg, Object),
            (Sum, Object),
            (Min, Object),
            (Max, Object),
        ];
        const GROUP_BY: &[(QueryOption, ValueKind)] = &[
            (By, Fields),
            (Where, Object),
            (OrderBy, ObjectOrArray),
            (Having, Object),
            (Take, Integer),
            (Skip, Integer),
            (CountAggregate, FlagOrObject),
            (Avg, Object),
            (Sum, Object),
            (Min, Object),
            (Max, Object),
        ];

        match self {
            Self::FindUnique => FIND_UNIQUE,
            Self::FindFirst | Self::FindMany => FIND,
            Self::Create => CREATE,
            Self::Update => UPDATE,
            Self::Delete => DELETE,
            Self::Upsert => UPSERT,
            Self::Count => COUNT,
            Self::Aggregate => AGGREGATE,
            Self::GroupBy => GROUP_BY,
        }
    }

    /// Expected kind for `option`, if this operation recognizes it.
    pub fn option_kind(&self, option: QueryOption) -> Option<ValueKind> {
        self.options()
            .iter()
            .find(|(o, _)| *o == option)
            .map(|(_, kind)| *kind)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| QuarryError::Config(format!("unknown operation '{}'", s)))
    }
}

/// A top-level argument key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOption {
    Where,
    OrderBy,
    Select,
    Include,
    Data,
    Take,
    Skip,
    Distinct,
    Cursor,
    Create,
    Update,
    By,
    Having,
    CountAggregate,
    Avg,
    Sum,
    Min,
    Max,
}

impl QueryOption {
    pub const ALL: [QueryOption; 18] = [
        QueryOption::Where,
        QueryOption::OrderBy,
        QueryOption::Select,
        QueryOption::Include,
        QueryOption::Data,
        QueryOption::Take,
        QueryOption::Skip,
        QueryOption::Distinct,
        QueryOption::Cursor,
        QueryOption::Create,
        QueryOption::Update,
        QueryOption::By,
        QueryOption::Having,
        QueryOption::CountAggregate,
        QueryOption::Avg,
        QueryOption::Sum,
        QueryOption::Min,
        QueryOption::Max,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Where => "where",
            Self::OrderBy => "orderBy",
            Self::Select => "select",
            Self::Include => "include",
            Self::Data => "data",
            Self::Take => "take",
            Self::Skip => "skip",
            Self::Distinct => "distinct",
            Self::Cursor => "cursor",
            Self::Create => "create",
            Self::Update => "update",
            Self::By => "by",
            Self::Having => "having",
            Self::CountAggregate => "_count",
            Self::Avg => "_avg",
            Self::Sum => "_sum",
            Self::Min => "_min",
            Self::Max => "_max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.name() == name)
    }
}

impl fmt::Display for QueryOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape an option's value must have. Only the top level is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Object,
    ObjectOrArray,
    Integer,
    /// A field name or an array of field names.
    Fields,
    /// `true` or an object of field flags.
    FlagOrObject,
}

impl ValueKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::ObjectOrArray => value.is_object() || value.is_array(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Fields => match value {
                Value::String(_) => true,
                Value::Array(items) => items.iter().all(Value::is_string),
                _ => false,
            },
            Self::FlagOrObject => value.is_boolean() || value.is_object(),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Object => "an object",
            Self::ObjectOrArray => "an object or an array",
            Self::Integer => "an integer",
            Self::Fields => "a field name or an array of field names",
            Self::FlagOrObject => "true or an object",
        }
    }
}

/// Schema description supplied by the data-access collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    #[serde(default, rename = "entity")]
    pub entities: Vec<EntitySchema>,
}

/// One entity as declared in a schema description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Model name, e.g. `User`.
    pub name: String,
    /// Backing table, defaults to the model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Supported operations, defaults to all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            operations: None,
            fields: Vec::new(),
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations = Some(operations.into_iter().collect());
        self
    }
}

impl SchemaDescription {
    pub fn new(entities: Vec<EntitySchema>) -> Self {
        Self { entities }
    }

    /// Parse a TOML schema description (`[[entity]]` tables).
    pub fn from_toml_str(content: &str) -> QuarryResult<Self> {
        toml::from_str(content)
            .map_err(|e| QuarryError::Config(format!("Failed to parse schema: {}", e)))
    }

    /// Load a schema description from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> QuarryResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let schema = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| QuarryError::Config(format!("Failed to parse schema: {}", e)))?,
            _ => Self::from_toml_str(&content)?,
        };
        tracing::debug!("Loaded schema description from {}", path.display());
        Ok(schema)
    }
}

/// A registered entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    name: String,
    accessor: String,
    table: String,
    operations: Vec<Operation>,
    fields: Vec<String>,
}

impl EntityDescriptor {
    /// Model name, e.g. `User`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Client accessor, e.g. `user`.
    pub fn accessor(&self) -> &str {
        &self.accessor
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Immutable lookup of entities by name.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: Vec<EntityDescriptor>,
    by_name: HashMap<String, usize>,
}

impl EntityRegistry {
    /// Build the registry. Entity names (and their accessors) must be unique.
    pub fn from_schema(schema: &SchemaDescription) -> QuarryResult<Self> {
        let mut registry = Self::default();

        for entity in &schema.entities {
            let name = entity.name.trim();
            if !is_identifier(name) {
                return Err(QuarryError::Config(format!(
                    "invalid entity name '{}': expected an ASCII letter, '_' or '$' \
                     followed by letters, digits, '_' or '$'",
                    entity.name
                )));
            }

            let mut operations = entity
                .operations
                .clone()
                .unwrap_or_else(|| Operation::ALL.to_vec());
            operations.sort();
            operations.dedup();

            let descriptor = EntityDescriptor {
                name: name.to_string(),
                accessor: accessor_name(name),
                table: entity.table.clone().unwrap_or_else(|| name.to_string()),
                operations,
                fields: entity.fields.clone(),
            };

            let index = registry.entities.len();
            for key in [descriptor.name.clone(), descriptor.accessor.clone()] {
                if let Some(&existing) = registry.by_name.get(&key) {
                    if existing != index {
                        return Err(QuarryError::Config(format!(
                            "duplicate entity '{}'",
                            key
                        )));
                    }
                }
                registry.by_name.insert(key, index);
            }
            registry.entities.push(descriptor);
        }

        tracing::debug!("Registered {} entities", registry.entities.len());
        Ok(registry)
    }

    /// Look up an entity by accessor (`user`) or model name (`User`).
    pub fn resolve(&self, name: &str) -> Option<&EntityDescriptor> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn entities(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Closest accessor to an unknown entity name.
    pub fn suggest_entity(&self, name: &str) -> Option<String> {
        let candidates: Vec<&str> = self.entities.iter().map(|e| e.accessor()).collect();
        did_you_mean(name, &candidates)
    }

    /// Closest supported operation name for an entity.
    pub fn suggest_operation(&self, entity: &EntityDescriptor, name: &str) -> Option<String> {
        let candidates: Vec<&str> = entity.operations.iter().map(|op| op.name()).collect();
        did_you_mean(name, &candidates)
    }
}

/// `User` → `user`, `BlogPost` → `blogPost`.
pub fn accessor_name(model: &str) -> String {
    let mut chars = model.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn did_you_mean(input: &str, candidates: &[&str]) -> Option<String> {
    let mut best_match = None;
    let mut min_dist = usize::MAX;

    for &cand in candidates {
        let dist = levenshtein(&input.to_lowercase(), &cand.to_lowercase());
        if dist < min_dist {
            min_dist = dist;
            best_match = Some(cand);
        }
    }

    // Only suggest close matches
    let threshold = match input.len() {
        0..=2 => 0,
        3..=5 => 2,
        _ => 3,
    };

    if min_dist <= threshold {
        best_match.map(|s| s.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn schema() -> SchemaDescription {
        SchemaDescription::new(vec![
            EntitySchema::new("User").fields(["id", "name", "active"]),
            EntitySchema::new("Post").operations([Operation::FindMany, Operation::Count]),
        ])
    }

    #[test]
    fn test_resolve_by_accessor_and_model_name() {
        let registry = EntityRegistry::from_schema(&schema()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("user").unwrap().name(), "User");
        assert_eq!(registry.resolve("User").unwrap().accessor(), "user");
        assert!(registry.resolve("ghost").is_none());
    }

    #[test]
    fn test_operations_default_to_all() {
        let registry = EntityRegistry::from_schema(&schema()).unwrap();
        let user = registry.resolve("user").unwrap();
        assert_eq!(user.operations().len(), Operation::ALL.len());

        let post = registry.resolve("post").unwrap();
        assert!(post.supports(Operation::FindMany));
        assert!(!post.supports(Operation::Delete));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let schema = SchemaDescription::new(vec![EntitySchema::new("User"), EntitySchema::new("user")]);
        let err = EntityRegistry::from_schema(&schema).unwrap_err();
        assert!(err.to_string().contains("duplicate entity"));
    }

    #[test]
    fn test_unqueryable_entity_names_rejected() {
        for name in ["Café", "2fa", "Blog Post", "User-Log", ""] {
            let schema = SchemaDescription::new(vec![EntitySchema::new(name)]);
            let err = EntityRegistry::from_schema(&schema).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "{}", name);
        }

        let schema = SchemaDescription::new(vec![EntitySchema::new("_Audit$2")]);
        let registry = EntityRegistry::from_schema(&schema).unwrap();
        assert!(registry.resolve("_Audit$2").is_some());
    }

    #[test]
    fn test_suggestions() {
        let registry = EntityRegistry::from_schema(&schema()).unwrap();
        assert_eq!(registry.suggest_entity("usr"), Some("user".to_string()));
        assert_eq!(registry.suggest_entity("invoice"), None);

        let user = registry.resolve("user").unwrap();
        assert_eq!(
            registry.suggest_operation(user, "findManny"),
            Some("findMany".to_string())
        );
    }

    #[test]
    fn test_operation_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(op));
        }
        assert_eq!(Operation::from_name("drop"), None);
        assert!(Operation::Upsert.is_mutation());
        assert!(!Operation::Count.is_mutation());
    }

    #[test]
    fn test_option_kinds() {
        assert_eq!(
            Operation::FindMany.option_kind(QueryOption::Take),
            Some(ValueKind::Integer)
        );
        assert_eq!(Operation::Create.option_kind(QueryOption::Where), None);
        assert!(ValueKind::Fields.accepts(&json!(["name", "role"])));
        assert!(!ValueKind::Fields.accepts(&json!([1, 2])));
        assert!(ValueKind::FlagOrObject.accepts(&json!(true)));
        assert!(!ValueKind::Integer.accepts(&json!(1.5)));
    }

    #[test]
    fn test_schema_from_toml() {
        let schema = SchemaDescription::from_toml_str(
            r#"
            [[entity]]
            name = "User"
            fields = ["id", "name"]

            [[entity]]
            name = "AuditLog"
            table = "audit_log"
            operations = ["findMany", "count"]
            "#,
        )
        .unwrap();
        let registry = EntityRegistry::from_schema(&schema).unwrap();
        let log = registry.resolve("auditLog").unwrap();
        assert_eq!(log.table(), "audit_log");
        assert_eq!(log.operations(), &[Operation::FindMany, Operation::Count]);
    }
}
