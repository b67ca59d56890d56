//! Error types for Quarry.

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Stable classification of a [`QuarryError`], independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EmptyQuery,
    InvalidExpression,
    UnknownEntity,
    UnknownOperation,
    MalformedArguments,
    UnsupportedOption,
    DataAccess,
    Cancelled,
    Busy,
    Config,
    Io,
}

impl ErrorKind {
    /// Wire code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyQuery => "EMPTY_QUERY",
            Self::InvalidExpression => "INVALID_EXPRESSION",
            Self::UnknownEntity => "UNKNOWN_ENTITY",
            Self::UnknownOperation => "UNKNOWN_OPERATION",
            Self::MalformedArguments => "MALFORMED_ARGUMENTS",
            Self::UnsupportedOption => "UNSUPPORTED_OPTION",
            Self::DataAccess => "DATA_ACCESS_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Busy => "BUSY",
            Self::Config => "CONFIG_ERROR",
            Self::Io => "IO_ERROR",
        }
    }

    /// True for failures detected locally, before anything is dispatched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyQuery
                | Self::InvalidExpression
                | Self::UnknownEntity
                | Self::UnknownOperation
                | Self::MalformedArguments
                | Self::UnsupportedOption
        )
    }

    /// HTTP status code for errors of this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            kind if kind.is_validation() => 400,
            Self::Busy => 409,
            Self::Cancelled => 408,
            _ => 500,
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The main error type for Quarry operations.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Nothing but whitespace was submitted.
    #[error("Query is required")]
    EmptyQuery,

    /// The text is not shaped like `<entity>.<operation>(...)`.
    #[error("Invalid expression at position {position}: {message}")]
    InvalidExpression { position: usize, message: String },

    #[error("Unknown entity '{entity}'{}", did_you_mean(.suggestion))]
    UnknownEntity {
        entity: String,
        position: usize,
        suggestion: Option<String>,
    },

    #[error("Unknown operation '{operation}' on entity '{entity}'{}", did_you_mean(.suggestion))]
    UnknownOperation {
        entity: String,
        operation: String,
        position: usize,
        suggestion: Option<String>,
    },

    /// The argument text is not a valid data literal.
    #[error("Malformed arguments at position {position}: {message}")]
    MalformedArguments { position: usize, message: String },

    #[error("Option '{option}' is not supported by {operation}")]
    UnsupportedOption {
        operation: String,
        option: String,
        position: usize,
    },

    /// Failure reported by the data-access collaborator, message verbatim.
    #[error("{0}")]
    DataAccess(String),

    #[error("Query cancelled: {0}")]
    Cancelled(String),

    #[error("A query is already running in this session")]
    Busy,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(". Did you mean '{}'?", s),
        None => String::new(),
    }
}

impl QuarryError {
    /// Create a malformed-arguments error at the given position.
    pub fn malformed(position: usize, message: impl Into<String>) -> Self {
        Self::MalformedArguments {
            position,
            message: message.into(),
        }
    }

    /// Create an invalid-expression error at the given position.
    pub fn invalid(position: usize, message: impl Into<String>) -> Self {
        Self::InvalidExpression {
            position,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyQuery => ErrorKind::EmptyQuery,
            Self::InvalidExpression { .. } => ErrorKind::InvalidExpression,
            Self::UnknownEntity { .. } => ErrorKind::UnknownEntity,
            Self::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            Self::MalformedArguments { .. } => ErrorKind::MalformedArguments,
            Self::UnsupportedOption { .. } => ErrorKind::UnsupportedOption,
            Self::DataAccess(_) => ErrorKind::DataAccess,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Busy => ErrorKind::Busy,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Byte offset into the query text, where one is known.
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::InvalidExpression { position, .. }
            | Self::UnknownEntity { position, .. }
            | Self::UnknownOperation { position, .. }
            | Self::MalformedArguments { position, .. }
            | Self::UnsupportedOption { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

/// Result type alias for Quarry operations.
pub type QuarryResult<T> = Result<T, QuarryError>;
