//! Message types for display and storage
//!
//! [`Message`] is the decoded form of one record under
//! `chats/{key}/messages/{id}`:
//!
//! ```text
//! { "sender": "alice", "text": "hi", "timestamp": 1705123456789,
//!   "file": { "uri": "blob://…", "type": "image/png", "name": "cat.png" } }
//! ```
//!
//! `file` is absent (or null) for plain text messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};
use crate::types::{MessageId, UserId};

/// Broad category of an attachment, derived from its content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
}

impl AttachmentKind {
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }
}

/// Durable reference to an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// URI returned by the object storage
    pub uri: String,
    /// MIME type as declared at upload
    #[serde(rename = "type")]
    pub content_type: String,
    /// Original file name
    pub name: String,
}

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::from_content_type(&self.content_type)
    }
}

/// Stored shape of a message (the id is the record's key, not a field)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MessageRecord {
    pub sender: UserId,
    #[serde(default)]
    pub text: String,
    pub timestamp: i64,
    #[serde(default)]
    pub file: Option<Attachment>,
}

/// A message in a conversation feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned key, ordered by allocation
    pub id: MessageId,
    /// Author
    pub sender: UserId,
    /// Body text, may be empty when an attachment is present
    pub text: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Optional attachment
    pub attachment: Option<Attachment>,
}

impl Message {
    /// Decode the record stored under `id`.
    ///
    /// Returns `None` for records that are not a valid message: wrong
    /// shape, invalid sender, or neither text nor attachment.
    pub fn from_value(id: &str, value: &Value) -> Option<Self> {
        let id = MessageId::new(id).ok()?;
        let record: MessageRecord = serde_json::from_value(value.clone()).ok()?;
        if record.text.trim().is_empty() && record.file.is_none() {
            return None;
        }
        Some(Self {
            id,
            sender: record.sender,
            text: record.text,
            timestamp: record.timestamp,
            attachment: record.file,
        })
    }

    pub(crate) fn to_record(&self) -> MessageRecord {
        MessageRecord {
            sender: self.sender.clone(),
            text: self.text.clone(),
            timestamp: self.timestamp,
            file: self.attachment.clone(),
        }
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender == user
    }

    /// Short single-line preview: the text truncated to `max_chars`
    /// characters, or the attachment name when there is no text.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.text.trim();
        if text.is_empty() {
            return match &self.attachment {
                Some(file) => format!("📎 {}", file.name),
                None => String::new(),
            };
        }
        let first_line = text.lines().next().unwrap_or_default();
        if first_line.chars().count() > max_chars {
            let truncated: String = first_line.chars().take(max_chars).collect();
            format!("{}...", truncated)
        } else if first_line.len() < text.len() {
            format!("{}...", first_line)
        } else {
            first_line.to_string()
        }
    }

    /// Format the timestamp relative to `now_ms`.
    ///
    /// Returns strings like "Just now", "5m ago", "2h ago", "Yesterday", etc.
    pub fn relative_time(&self, now_ms: i64) -> String {
        let diff_secs = (now_ms - self.timestamp) / 1000;

        if diff_secs < 60 {
            "Just now".to_string()
        } else if diff_secs < 3600 {
            format!("{}m ago", diff_secs / 60)
        } else if diff_secs < 86400 {
            format!("{}h ago", diff_secs / 3600)
        } else if diff_secs < 172800 {
            "Yesterday".to_string()
        } else {
            format!("{}d ago", diff_secs / 86400)
        }
    }
}

/// File to upload along with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftAttachment {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub name: String,
}

/// A message the local user is about to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDraft {
    text: String,
    attachment: Option<DraftAttachment>,
}

impl MessageDraft {
    /// Text-only draft. Surrounding whitespace is trimmed.
    pub fn text(text: impl AsRef<str>) -> Self {
        Self {
            text: text.as_ref().trim().to_string(),
            attachment: None,
        }
    }

    /// Attach a file. The upload happens when the draft is sent.
    pub fn with_attachment(
        mut self,
        bytes: Vec<u8>,
        content_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.attachment = Some(DraftAttachment {
            bytes,
            content_type: content_type.into(),
            name: name.into(),
        });
        self
    }

    /// Draft sharing a map link to the given coordinates.
    pub fn location(latitude: f64, longitude: f64) -> ChatResult<Self> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ChatError::InvalidOperation(format!(
                "coordinates out of range: {}, {}",
                latitude, longitude
            )));
        }
        Ok(Self::text(format!(
            "🗺️ Location: https://www.google.com/maps?q={},{}",
            latitude, longitude
        )))
    }

    pub fn body(&self) -> &str {
        &self.text
    }

    pub fn attachment(&self) -> Option<&DraftAttachment> {
        self.attachment.as_ref()
    }

    pub(crate) fn into_parts(self) -> (String, Option<DraftAttachment>) {
        (self.text, self.attachment)
    }

    /// Reject drafts with neither text nor an attachment.
    pub fn validate(&self) -> ChatResult<()> {
        if self.text.is_empty() && self.attachment.is_none() {
            return Err(ChatError::InvalidOperation(
                "message needs text or an attachment".to_string(),
            ));
        }
        if let Some(file) = &self.attachment {
            if file.bytes.is_empty() {
                return Err(ChatError::InvalidOperation(format!(
                    "attachment {:?} is empty",
                    file.name
                )));
            }
        }
        Ok(())
    }
}
