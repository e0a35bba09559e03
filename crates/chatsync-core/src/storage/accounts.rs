//! Account Storage - credential records and the current session
//!
//! Records are keyed by normalized (trimmed, lowercased) email. Passwords
//! are never stored; only a salted BLAKE3 digest is kept.

use crate::error::ChatError;
use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use super::Storage;

/// Table for credential records (key: normalized email, value: serialized StoredAccount)
pub(crate) const ACCOUNTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");

/// Table for the signed-in session (key: SESSION_KEY, value: user id bytes)
pub(crate) const SESSION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("session");

const SESSION_KEY: &str = "current";

/// One registered credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAccount {
    /// User id assigned at registration
    pub user_id: String,
    /// Random per-account salt
    pub salt: [u8; 16],
    /// BLAKE3 digest of salt || password
    pub digest: [u8; 32],
}

impl StoredAccount {
    /// Create a record for `password` with a fresh random salt.
    pub fn new(user_id: impl Into<String>, password: &str) -> Self {
        let salt: [u8; 16] = rand::random();
        Self {
            user_id: user_id.into(),
            salt,
            digest: Self::digest(&salt, password),
        }
    }

    /// Check a candidate password against the stored digest.
    pub fn verify(&self, password: &str) -> bool {
        Self::digest(&self.salt, password) == self.digest
    }

    fn digest(salt: &[u8; 16], password: &str) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Account Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a credential record, overwriting any record for the same email.
    pub fn save_account(&self, email: &str, account: &StoredAccount) -> Result<(), ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCOUNTS_TABLE)?;
            let serialized = postcard::to_allocvec(account)
                .map_err(|e| ChatError::Serialization(e.to_string()))?;
            table.insert(email, serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the credential record for `email`.
    ///
    /// Returns `None` if no account is registered under that email.
    pub fn load_account(&self, email: &str) -> Result<Option<StoredAccount>, ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;

        if let Some(data) = table.get(email)? {
            let account: StoredAccount = postcard::from_bytes(data.value())
                .map_err(|e| ChatError::Serialization(e.to_string()))?;
            Ok(Some(account))
        } else {
            Ok(None)
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Record the signed-in user, or clear the session with `None`.
    pub fn save_session(&self, user_id: Option<&str>) -> Result<(), ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSION_TABLE)?;
            match user_id {
                Some(id) => {
                    table.insert(SESSION_KEY, id.as_bytes())?;
                }
                None => {
                    table.remove(SESSION_KEY)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the signed-in user id, if any.
    pub fn load_session(&self) -> Result<Option<String>, ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;

        match table.get(SESSION_KEY)? {
            Some(data) => {
                let id = String::from_utf8(data.value().to_vec())
                    .map_err(|e| ChatError::Serialization(e.to_string()))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }
}
