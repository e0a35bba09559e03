//! User profile records stored at `users/{id}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profile of a registered user.
///
/// Every field is optional in the store (older records may lack `phone` or
/// `online`), so all of them default when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    /// Display name chosen at registration
    pub name: String,
    /// Email address (used to look users up when adding contacts)
    pub email: String,
    /// Phone number, used by the presentation layer's "call" action
    pub phone: String,
    /// Avatar reference (public URI returned by object storage)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Set on sign-in, cleared on sign-out
    pub online: bool,
}

impl UserProfile {
    /// Build a fresh, offline profile.
    pub fn new(name: impl Into<String>, email: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            phone: phone.into(),
            picture: None,
            online: false,
        }
    }

    /// Parse a profile from a store snapshot, tolerating missing fields.
    ///
    /// Non-object values (for example a bare string written by a buggy
    /// client) yield `None` rather than an error.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Case-insensitive comparison against a (trimmed) email address
    pub fn has_email(&self, email: &str) -> bool {
        !self.email.is_empty() && self.email.trim().eq_ignore_ascii_case(email.trim())
    }
}

/// Partial profile edit. Only the fields that are set get written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub picture: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.picture.is_none()
    }

    /// Fields to merge into `users/{id}`
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(name) = &self.name {
            fields.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(email) = &self.email {
            fields.insert("email".to_string(), Value::String(email.trim().to_string()));
        }
        if let Some(phone) = &self.phone {
            fields.insert("phone".to_string(), Value::String(phone.clone()));
        }
        if let Some(picture) = &self.picture {
            fields.insert("picture".to_string(), Value::String(picture.clone()));
        }
        fields
    }
}
