//! Local persistent storage using redb.
//!
//! Backs the local implementations of the external collaborators:
//! - The data tree of [`MemoryStore`](crate::store::MemoryStore), one row per top-level node
//! - Credential records and the current session ([`LocalIdentity`](crate::services::LocalIdentity))
//! - Content-addressed attachment blobs ([`BlobObjectStorage`](crate::services::BlobObjectStorage))

use crate::error::ChatError;
use parking_lot::RwLock;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

// Submodules
mod accounts;
mod blobs;
mod tree;

use accounts::{ACCOUNTS_TABLE, SESSION_TABLE};
use blobs::{BLOBS_TABLE, BLOB_TYPES_TABLE};
use tree::TREE_TABLE;

pub use accounts::StoredAccount;

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TREE_TABLE)?;
            let _ = write_txn.open_table(ACCOUNTS_TABLE)?;
            let _ = write_txn.open_table(SESSION_TABLE)?;
            let _ = write_txn.open_table(BLOBS_TABLE)?;
            let _ = write_txn.open_table(BLOB_TYPES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Shared database handle for the per-table submodules
    pub(crate) fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}
