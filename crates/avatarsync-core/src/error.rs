//! Error types for the avatar synchronization engine

use thiserror::Error;

/// Main error type for avatar engine operations
#[derive(Error, Debug)]
pub enum AvatarError {
    /// Error during persistent-tier operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization of stored records
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Remote fetch failed (transport/timeout/remote-rejected)
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// A hash token was not valid hex or had the wrong length
    #[error("Invalid avatar hash: {0}")]
    InvalidHash(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using AvatarError
pub type AvatarResult<T> = Result<T, AvatarError>;
