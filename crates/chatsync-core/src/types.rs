//! Core types for the chat synchronization engine
//!
//! Identifiers are opaque, store-assigned strings. They are validated on
//! construction so they can always be used as a single store path segment
//! and can never contain the conversation-key separator.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

pub mod contact;
pub mod group;
pub mod profile;

pub use contact::{ContactEntry, ContactRef};
pub use group::Group;
pub use profile::{ProfileUpdate, UserProfile};

/// Characters that may never appear in an identifier.
///
/// The first six are reserved by the store's path grammar; `~` is reserved
/// as the conversation-key separator.
pub const RESERVED_ID_CHARS: &[char] = &['.', '$', '#', '[', ']', '/', '~'];

fn validate_id(kind: &str, value: &str) -> ChatResult<()> {
    if value.is_empty() {
        return Err(ChatError::InvalidOperation(format!("{} must not be empty", kind)));
    }
    if let Some(c) = value.chars().find(|c| RESERVED_ID_CHARS.contains(c) || c.is_control()) {
        return Err(ChatError::InvalidOperation(format!(
            "{} {:?} contains reserved character {:?}",
            kind, value, c
        )));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw identifier
            pub fn new(value: impl Into<String>) -> ChatResult<Self> {
                let value = value.into();
                validate_id($kind, &value)?;
                Ok(Self(value))
            }

            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ChatError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ChatError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a registered user (assigned by the identity service)
    UserId,
    "user id"
);

string_id!(
    /// Identifier of a group (allocated by the store on creation)
    GroupId,
    "group id"
);

string_id!(
    /// Identifier of a message (allocated by the store on append)
    ///
    /// Keys allocated by `append_child` sort in allocation order.
    MessageId,
    "message id"
);

/// Current time as Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
