//! Resolution of query text into a validated [`CallDescriptor`].
//!
//! Steps, each failing fast:
//!
//! 1. empty text → `EmptyQuery`
//! 2. entity must be registered → `UnknownEntity`
//! 3. operation must be supported by that entity → `UnknownOperation`
//! 4. argument text must be a data literal → `MalformedArguments`
//! 5. top-level keys must be options of the operation → `UnsupportedOption`
//!    (or dropped with a warning when `strict_options` is off)
//!
//! Values below the top level are not checked against the schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{QuarryError, QuarryResult};
use crate::parser::literal::LiteralParser;
use crate::parser::CallParser;
use crate::registry::{EntityRegistry, Operation, QueryOption};

/// Top-level argument object.
pub type Arguments = Map<String, Value>;

/// Resolver limits and strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Reject unknown top-level keys instead of dropping them.
    pub strict_options: bool,
    /// Deepest allowed object/array nesting; the argument object is level 1.
    pub max_argument_depth: usize,
    /// Longest accepted query text, in bytes.
    pub max_query_length: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            strict_options: true,
            max_argument_depth: 32,
            max_query_length: 64 * 1024,
        }
    }
}

/// One validated request: entity + operation + argument tree. Data only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallDescriptor {
    entity: String,
    operation: Operation,
    arguments: Arguments,
}

impl CallDescriptor {
    /// Model name of the target entity.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn into_arguments(self) -> Arguments {
        self.arguments
    }
}

impl std::fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.entity,
            self.operation,
            Value::Object(self.arguments.clone())
        )
    }
}

/// Binds query text to the registry.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<EntityRegistry>,
    options: ResolverOptions,
}

impl Resolver {
    pub fn new(registry: Arc<EntityRegistry>, options: ResolverOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    pub fn resolve(&self, text: &str) -> QuarryResult<CallDescriptor> {
        if text.trim().is_empty() {
            return Err(QuarryError::EmptyQuery);
        }
        if text.len() > self.options.max_query_length {
            return Err(QuarryError::malformed(
                self.options.max_query_length,
                format!(
                    "query is longer than the limit of {} bytes",
                    self.options.max_query_length
                ),
            ));
        }

        let parser = CallParser::new(text);

        let (rest, entity_name) = parser.entity()?;
        let Some(entity) = self.registry.resolve(entity_name.text) else {
            return Err(QuarryError::UnknownEntity {
                entity: entity_name.text.to_string(),
                position: entity_name.position,
                suggestion: self.registry.suggest_entity(entity_name.text),
            });
        };

        let (rest, op_name) = parser.operation(rest)?;
        let operation = match Operation::from_name(op_name.text) {
            Some(op) if entity.supports(op) => op,
            _ => {
                return Err(QuarryError::UnknownOperation {
                    entity: entity.accessor().to_string(),
                    operation: op_name.text.to_string(),
                    position: op_name.position,
                    suggestion: self.registry.suggest_operation(entity, op_name.text),
                });
            }
        };

        let literals = LiteralParser::new(self.options.max_argument_depth);
        let (rest, entries) = parser.arguments(rest, literals)?;
        parser.finish(rest)?;

        let mut arguments = Map::new();
        for entry in entries {
            let position = parser.offset(entry.at);
            let known = QueryOption::from_name(&entry.key).and_then(|o| {
                operation.option_kind(o).map(|kind| (o, kind))
            });

            match known {
                Some((option, kind)) => {
                    if !kind.accepts(&entry.value) {
                        return Err(QuarryError::malformed(
                            position,
                            format!(
                                "option '{}' of {} expects {}",
                                option,
                                operation,
                                kind.describe()
                            ),
                        ));
                    }
                    arguments.insert(entry.key, entry.value);
                }
                None if self.options.strict_options => {
                    return Err(QuarryError::UnsupportedOption {
                        operation: operation.to_string(),
                        option: entry.key,
                        position,
                    });
                }
                None => {
                    tracing::warn!(
                        "Dropping unsupported option '{}' for {}.{}",
                        entry.key,
                        entity.accessor(),
                        operation
                    );
                }
            }
        }

        let call = CallDescriptor {
            entity: entity.name().to_string(),
            operation,
            arguments,
        };
        tracing::debug!("Resolved {}", call);
        Ok(call)
    }
}
