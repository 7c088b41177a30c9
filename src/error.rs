use thiserror::Error;

/// Main error type for graphweld
#[derive(Error, Debug)]
pub enum GraphweldError {
    /// Malformed mention or attribute, rejected before touching any structure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Tombstone redirect chain formed a cycle. This indicates a logic bug:
    /// merges always point the absorbed entity at an older survivor, so a
    /// cycle cannot arise by construction.
    #[error("Merge cycle detected: {0}")]
    MergeCycle(String),

    /// The persistence backend rejected or failed an operation. Fatal to the
    /// current batch; the caller may retry the batch wholesale.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Database-related errors (SQLite store backend)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization of ledger/attribute payloads
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Conflict record not found
    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    /// Entity or relationship not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Convenient Result type using GraphweldError
pub type Result<T> = std::result::Result<T, GraphweldError>;
