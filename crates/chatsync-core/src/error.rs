//! Error types for the chat synchronization core

use thiserror::Error;

/// Main error type for chat synchronization operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// Referenced user, contact, group or conversation is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store rejected a write (concurrent writer won)
    #[error("Write conflict at {0}")]
    WriteConflict(String),

    /// Attachment upload failed; no message was written
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// Credential operation rejected by the identity service
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Transport-level listener failure
    #[error("Subscription error at {path}: {message}")]
    Subscription {
        /// Path the listener was attached to
        path: String,
        /// Reason reported by the store
        message: String,
    },

    /// Malformed store path or path segment
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid operation for current state or input
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during local storage operations (redb)
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

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether the error is a rejected write that may succeed on retry
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, ChatError::WriteConflict(_))
    }

    /// Whether the error describes an absent entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChatError::NotFound(_))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(err.to_string())
    }
}

/// Result type alias using ChatError
pub type ChatResult<T> = Result<T, ChatError>;
