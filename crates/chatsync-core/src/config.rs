//! Runtime configuration for the chat engine
//!
//! Every field has a default, so a config file only needs to list the
//! values it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Tunables shared by every sync stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Capacity of the `ChatEvent` broadcast channel
    pub event_channel_capacity: usize,
    /// Retries after a rejected write before the error is surfaced
    pub write_retries: u32,
    /// Delay between write attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Resubscription attempts after a listener is cancelled by the store
    pub resubscribe_attempts: u32,
    /// Name shown for a referenced user whose profile no longer exists
    pub placeholder_name: String,
    /// Name shown for a direct conversation with someone not in the contact list
    pub unknown_contact_name: String,
    /// Name shown for a group without a name
    pub unnamed_group_name: String,
    /// Maximum group name length, in characters
    pub max_group_name_len: usize,
    /// Maximum attachment size accepted by the local object storage
    pub max_upload_bytes: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
            write_retries: 1,
            retry_delay_ms: 50,
            resubscribe_attempts: 3,
            placeholder_name: "Unknown".to_string(),
            unknown_contact_name: "Unknown User".to_string(),
            unnamed_group_name: "Unnamed Group".to_string(),
            max_group_name_len: 50,
            max_upload_bytes: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ChatConfig {
    /// Load a config from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> ChatResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_json_slice(&bytes)
    }

    /// Parse a config from JSON bytes.
    pub fn from_json_slice(bytes: &[u8]) -> ChatResult<Self> {
        let config: ChatConfig = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> ChatResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(ChatError::InvalidOperation(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_group_name_len == 0 {
            return Err(ChatError::InvalidOperation(
                "max_group_name_len must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay between write attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.write_retries, 1);
        assert_eq!(config.placeholder_name, "Unknown");
        assert_eq!(config.retry_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ChatConfig::from_json_slice(br#"{"write_retries": 3}"#).unwrap();
        assert_eq!(config.write_retries, 3);
        assert_eq!(config.unnamed_group_name, "Unnamed Group");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = ChatConfig::from_json_slice(br#"{"event_channel_capacity": 0}"#);
        assert!(matches!(result, Err(ChatError::InvalidOperation(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatsync.json");
        std::fs::write(&path, r#"{"placeholder_name": "Ghost"}"#).unwrap();

        let config = ChatConfig::from_json_file(&path).unwrap();
        assert_eq!(config.placeholder_name, "Ghost");
    }
}
