//! Error types for shelfscan.
//!
//! Defines the main error enum used throughout the application.

use thiserror::Error;

/// Main error type for shelfscan operations.
#[derive(Error, Debug)]
pub enum ShelfError {
    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query errors (malformed predicate, unsupported field, engine failure, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// Index creation conflicts with an existing index definition.
    #[error("Index error: {0}")]
    Index(String),

    /// Configuration errors (invalid config file, bad URL, unreadable plan, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),

    /// A named query in the report failed.
    #[error("'{label}' failed: {source}")]
    Failed {
        label: String,
        #[source]
        source: Box<ShelfError>,
    },
}

impl ShelfError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates an index error with the given message.
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Attaches the label of the query that produced this error.
    pub fn labeled(self, label: impl Into<String>) -> Self {
        Self::Failed {
            label: label.into(),
            source: Box::new(self),
        }
    }

    /// Returns the label of the failing query, if this error carries one.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Failed { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::Index(_) => "Index Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
            Self::Failed { source, .. } => source.category(),
        }
    }
}

/// Result type alias using ShelfError.
pub type Result<T> = std::result::Result<T, ShelfError>;
