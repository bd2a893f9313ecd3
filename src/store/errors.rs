use std::path::PathBuf;

use thiserror::Error;

use crate::store::serial::Serial;
use crate::validation::NameError;

/// Errors that can arise while interacting with the world store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around rusqlite's error type.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Wrapper around IO errors (directory creation, lock files, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapper around JSON dump serialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Data integrity failure: bad references, failed transaction steps, unresolved containers.
    #[error("data integrity error: {0}")]
    Integrity(String),

    /// A serial already present in the store or the resident world.
    #[error("data integrity error: duplicate serial {0}")]
    DuplicateSerial(Serial),

    /// Returned when the store file was written by an incompatible schema version.
    #[error("schema mismatch: expected version {expected}, found {found}")]
    SchemaMismatch { expected: i64, found: i64 },

    /// Metadata introspection found no columns for a table.
    #[error("table {table} has no columns")]
    EmptySchema { table: String },

    /// Statement text could not be prepared against the bound schema.
    #[error("failed to prepare statement for {table}: {source}")]
    Prepare {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Malformed search predicate. The message is meant for the caller.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Area or property name rejected by validation.
    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    /// Operation needs an object that is not memory-resident.
    #[error("object {0} is not resident")]
    NotResident(Serial),

    /// Tried to unload a subtree holding unsaved changes.
    #[error("object {0} has unsaved changes in its subtree")]
    DirtySubtree(Serial),

    /// Placement that would break the container graph (cycles, bad holders).
    #[error("invalid placement: {0}")]
    InvalidPlacement(String),

    /// The allocator ran past the top of its serial range.
    #[error("serial space exhausted")]
    SerialSpaceExhausted,

    /// Another process holds the store file.
    #[error("store {0} is locked by another process")]
    StoreLocked(PathBuf),

    /// The store is disabled in configuration.
    #[error("store is disabled")]
    Disabled,
}

impl StoreError {
    /// True for failures that belong to the data integrity family: these halt a load
    /// or commit unless load errors are configured to be ignored.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            StoreError::Integrity(_) | StoreError::DuplicateSerial(_)
        )
    }

    /// True when a rusqlite failure is a constraint violation (unique, foreign key).
    pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
