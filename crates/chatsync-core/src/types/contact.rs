//! Contact list entries stored at `users/{owner}/contactList/{contact}`
//!
//! A contact relationship is symmetric, but each side stores its own
//! pseudo (alias) for the other.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::UserId;

/// Stored form of one contact reference: just the alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactRef {
    /// Alias chosen by the owner of the list
    pub pseudo: String,
}

/// One side of a contact relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEntry {
    /// User whose contact list holds the entry
    pub owner: UserId,
    /// User the entry points at
    pub contact: UserId,
    /// Alias chosen by `owner` for `contact`
    pub pseudo: String,
}

impl ContactEntry {
    pub fn new(owner: UserId, contact: UserId, pseudo: impl Into<String>) -> Self {
        Self {
            owner,
            contact,
            pseudo: pseudo.into(),
        }
    }

    /// The entry the other side must hold for the relationship to be symmetric.
    pub fn reciprocal(&self, owner_name: impl Into<String>) -> Self {
        Self {
            owner: self.contact.clone(),
            contact: self.owner.clone(),
            pseudo: owner_name.into(),
        }
    }
}

/// Parse a contact-list snapshot into `(contact id, alias)` pairs.
///
/// Keys that are not valid user ids are skipped; an entry whose value is
/// not an object (legacy clients wrote `true`) gets an empty alias.
pub fn parse_contact_list(value: &Value) -> Vec<(UserId, String)> {
    let Some(entries) = value.as_object() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(key, entry)| {
            let id = UserId::new(key.as_str()).ok()?;
            let pseudo = serde_json::from_value::<ContactRef>(entry.clone())
                .map(|r| r.pseudo)
                .unwrap_or_default();
            Some((id, pseudo))
        })
        .collect()
}
