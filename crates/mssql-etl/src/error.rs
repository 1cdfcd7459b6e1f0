//! Error types for the migration engine.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Malformed or contradictory plan (invalid YAML, duplicate ids, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not reach one of the configured databases
    #[error("Connection error ({database}): {message}")]
    Connection { database: String, message: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A query's source text is not a single read-only SELECT
    #[error("Validation failed for query {query}: {message}")]
    Validation { query: String, message: String },

    /// Dynamic variable extraction failed
    #[error("Extraction failed for variable {variable}: {message}")]
    Extraction { variable: String, message: String },

    /// Source fetch, delete or batch insert failed for a query
    #[error("Query {query} failed: {message}")]
    QueryExecution { query: String, message: String },

    /// One statement of a pre/post-processing script failed
    #[error("Script {group} statement {index} failed: {message}")]
    ScriptStatement {
        group: String,
        index: usize,
        message: String,
    },

    /// Driver-level error
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Progress snapshot error
    #[error("State file error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    pub fn connection(database: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Connection {
            database: database.into(),
            message: message.to_string(),
        }
    }

    pub fn validation(query: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Validation {
            query: query.into(),
            message: message.into(),
        }
    }

    pub fn extraction(variable: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Extraction {
            variable: variable.into(),
            message: message.to_string(),
        }
    }

    pub fn query(query: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::QueryExecution {
            query: query.into(),
            message: message.to_string(),
        }
    }

    /// Stable kind name, recorded alongside the message in progress snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::Config(_) => "ConfigError",
            MigrateError::Connection { .. } | MigrateError::Pool { .. } => "ConnectionError",
            MigrateError::Validation { .. } => "ValidationError",
            MigrateError::Extraction { .. } => "ExtractionError",
            MigrateError::QueryExecution { .. } | MigrateError::Database(_) => {
                "QueryExecutionError"
            }
            MigrateError::ScriptStatement { .. } => "ScriptStatementError",
            MigrateError::State(_) | MigrateError::Json(_) => "StateError",
            MigrateError::Io(_) => "IoError",
            MigrateError::Yaml(_) => "ConfigError",
            MigrateError::Cancelled => "Cancelled",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Connection { .. } | MigrateError::Pool { .. } => 3,
            MigrateError::Validation { .. } => 4,
            MigrateError::Extraction { .. } => 5,
            MigrateError::QueryExecution { .. }
            | MigrateError::ScriptStatement { .. }
            | MigrateError::Database(_) => 6,
            MigrateError::State(_) | MigrateError::Json(_) | MigrateError::Io(_) => 7,
            MigrateError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
