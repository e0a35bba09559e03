//! Tree Storage - write-through persistence for the local data tree
//!
//! Each top-level node (`users`, `groups`, `chats`, ...) is stored as one
//! JSON document keyed by its name.

use crate::error::ChatError;
use redb::{ReadableTable, TableDefinition};
use serde_json::{Map, Value};

use super::Storage;

/// Table for top-level tree nodes (key: node name, value: JSON bytes)
pub(crate) const TREE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tree");

impl Storage {
    /// Save (or delete, when `value` is `None`) one top-level node.
    pub fn save_tree_node(&self, key: &str, value: Option<&Value>) -> Result<(), ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(TREE_TABLE)?;
            match value {
                Some(value) => {
                    let data = serde_json::to_vec(value)?;
                    table.insert(key, data.as_slice())?;
                }
                None => {
                    table.remove(key)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Replace every stored node with the children of `root`.
    pub fn save_tree(&self, root: &Map<String, Value>) -> Result<(), ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(TREE_TABLE)?;
            let stale: Vec<String> = table
                .iter()?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                .filter(|k| !root.contains_key(k))
                .collect();
            for key in stale {
                table.remove(key.as_str())?;
            }
            for (key, value) in root {
                let data = serde_json::to_vec(value)?;
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the whole tree.
    pub fn load_tree(&self) -> Result<Map<String, Value>, ChatError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(TREE_TABLE)?;

        let mut root = Map::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let node: Value = serde_json::from_slice(value.value())?;
            root.insert(key.value().to_string(), node);
        }
        Ok(root)
    }
}
