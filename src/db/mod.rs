pub mod records;
pub mod repository;
pub mod sqlite;
pub mod storage;

pub use records::*;
pub use repository::*;
pub use sqlite::*;
pub use storage::{SqliteStorage, Storage, StorageError};

use thiserror::Error;

use crate::models::ModelError;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Database directory unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    /// A stored column could not be decoded (bad UUID, timestamp or JSON).
    #[error("Corrupt {column} column: {reason}")]
    Corrupt { column: &'static str, reason: String },

    #[error("Failed to encode {column} column: {source}")]
    Encode {
        column: &'static str,
        source: serde_json::Error,
    },

    #[error("Stored record violates model constraints: {0}")]
    InvalidRecord(#[from] ModelError),
}
