//! Data-access collaborators.
//!
//! A [`DataSource`] describes its schema once and executes operations with
//! structured arguments. Two ship with the crate: [`MemoryStore`] (JSON
//! records held in process) and [`SqlStore`] (any sqlx-supported database).

pub mod filter;
pub mod memory;
pub mod sql;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::QuarryError;
use crate::registry::{Operation, SchemaDescription};
use crate::resolver::Arguments;

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Failure raised by a data source. The message reaches the user verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DataAccessError {
    message: String,
}

impl DataAccessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<DataAccessError> for QuarryError {
    fn from(err: DataAccessError) -> Self {
        QuarryError::DataAccess(err.message)
    }
}

/// The external system that owns persistence.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Entities and operations this source serves. Called once at startup.
    async fn describe(&self) -> Result<SchemaDescription, DataAccessError>;

    /// Execute one operation. `entity` is the model name.
    async fn invoke(
        &self,
        entity: &str,
        operation: Operation,
        arguments: Arguments,
    ) -> Result<Value, DataAccessError>;
}
