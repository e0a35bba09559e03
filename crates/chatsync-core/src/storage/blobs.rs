//! Blob Storage - content-addressed attachment storage
//!
//! Stores uploaded attachment bytes in redb keyed by their BLAKE3 hash,
//! with the declared content type kept alongside.

use crate::error::ChatError;
use redb::TableDefinition;

use super::Storage;

/// Table for blobs (key: BLAKE3 hash hex string, value: raw bytes)
pub(crate) const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Table for blob content types (key: BLAKE3 hash hex string, value: content type)
pub(crate) const BLOB_TYPES_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("blob_types");

impl Storage {
    /// Save a blob and return its content hash.
    ///
    /// If the blob already exists, returns the existing hash without
    /// re-storing the bytes.
    pub fn save_blob(&self, data: &[u8], content_type: &str) -> Result<String, ChatError> {
        let hash_hex = blake3::hash(data).to_hex().to_string();

        let db = self.db_handle();
        let db_guard = db.read();

        {
            let read_txn = db_guard.begin_read()?;
            let table = read_txn.open_table(BLOBS_TABLE)?;
            if table.get(hash_hex.as_str())?.is_some() {
                return Ok(hash_hex);
            }
        }

        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            table.insert(hash_hex.as_str(), data)?;
            let mut types = write_txn.open_table(BLOB_TYPES_TABLE)?;
            types.insert(hash_hex.as_str(), content_type)?;
        }
        write_txn.commit()?;

        Ok(hash_hex)
    }

    /// Load a blob and its content type by hash.
    ///
    /// Returns `None` if the blob doesn't exist.
    pub fn load_blob(&self, hash_hex: &str) -> Result<Option<(Vec<u8>, String)>, ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;

        let Some(data) = table.get(hash_hex)? else {
            return Ok(None);
        };
        let types = read_txn.open_table(BLOB_TYPES_TABLE)?;
        let content_type = types
            .get(hash_hex)?
            .map(|t| t.value().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(Some((data.value().to_vec(), content_type)))
    }

    /// Check if a blob exists by hash
    pub fn blob_exists(&self, hash_hex: &str) -> Result<bool, ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;

        Ok(table.get(hash_hex)?.is_some())
    }
}
