//! # quarry
//!
//! Type an entity query, get a table.
//!
//! quarry accepts ORM-style call expressions such as
//! `user.findMany({ where: { active: true }, take: 10 })`, checks them against
//! a fixed registry of entities and operations, and dispatches them to a data
//! source without ever evaluating user text as code.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use quarry::prelude::*;
//!
//! let config = QuarryConfig::builder().fixture("demos/fixture.json").build();
//! let engine = Engine::open(&config).await?;
//!
//! let rows = engine.run("user.findMany({ where: { active: true } })").await?;
//! print!("{}", TableModel::from_result_set(&rows, CellStyle::Compact).render_text());
//! ```
//!
//! ## Pipeline
//!
//! | Stage        | Module         | Output            |
//! |--------------|----------------|-------------------|
//! | Lex          | [`lexer`]      | tokens, lints     |
//! | Parse        | [`parser`]     | entity, op, args  |
//! | Resolve      | [`resolver`]   | `CallDescriptor`  |
//! | Dispatch     | [`dispatcher`] | raw JSON          |
//! | Normalize    | [`normalize`]  | `ResultSet`       |
//! | Present      | [`present`]    | table / JSON text |

pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod highlight;
pub mod lexer;
pub mod normalize;
pub mod parser;
pub mod present;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod session;
pub mod store;

pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::config::QuarryConfig;
    pub use crate::engine::{Engine, QueryOutcome};
    pub use crate::error::*;
    pub use crate::lexer::{lint, tokenize, Lexer, Token, TokenKind};
    pub use crate::normalize::{normalize, Cell, ResultRow, ResultSet};
    pub use crate::present::{render_json, CellStyle, TableModel};
    pub use crate::registry::{EntityRegistry, EntitySchema, Operation, SchemaDescription};
    pub use crate::resolver::{Arguments, CallDescriptor, Resolver, ResolverOptions};
    pub use crate::session::{Session, SessionState};
    pub use crate::store::{DataAccessError, DataSource, MemoryStore, SqlStore};
}

/// Resolve query text against a schema without touching any data source.
///
/// # Example
///
/// ```
/// use quarry::registry::{EntitySchema, SchemaDescription};
///
/// let schema = SchemaDescription::new(vec![EntitySchema::new("User")]);
/// let call = quarry::resolve(&schema, "user.findMany({ take: 2 })").unwrap();
/// assert_eq!(call.entity(), "User");
/// assert_eq!(call.arguments()["take"], 2);
/// ```
pub fn resolve(
    schema: &registry::SchemaDescription,
    text: &str,
) -> error::QuarryResult<resolver::CallDescriptor> {
    let registry = registry::EntityRegistry::from_schema(schema)?;
    resolver::Resolver::new(std::sync::Arc::new(registry), resolver::ResolverOptions::default())
        .resolve(text)
}
