//! Hierarchical store paths (`users/{id}/contactList/{contactId}`)

use std::fmt;

use crate::chat::ConversationKey;
use crate::error::{ChatError, ChatResult};
use crate::types::{GroupId, MessageId, UserId};

/// Characters the store's key grammar forbids inside a segment.
const FORBIDDEN_SEGMENT_CHARS: &[char] = &['.', '$', '#', '[', ']', '/'];

/// A validated, slash-separated path into the store tree.
///
/// The empty path is the root of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// The root of the tree
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse a slash-separated path. Leading and trailing slashes are ignored.
    pub fn parse(path: &str) -> ChatResult<Self> {
        let mut result = Self::root();
        for segment in path.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            result = result.child(segment)?;
        }
        Ok(result)
    }

    /// Extend the path by one validated segment.
    pub fn child(&self, segment: impl AsRef<str>) -> ChatResult<Self> {
        let segment = segment.as_ref();
        validate_segment(segment)?;
        Ok(self.child_unchecked(segment))
    }

    /// Extend by a segment that is already known to be valid (typed ids).
    pub(crate) fn child_unchecked(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Final segment (the key of the node this path points at)
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True if `other` is this path or lies below it.
    pub fn contains(&self, other: &StorePath) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// True if a change at one path can change the value seen at the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }

    // Well-known locations

    /// `users`
    pub fn users() -> Self {
        Self::root().child_unchecked("users")
    }

    /// `users/{id}`
    pub fn user(id: &UserId) -> Self {
        Self::users().child_unchecked(id.as_str())
    }

    /// `users/{owner}/contactList`
    pub fn contact_list(owner: &UserId) -> Self {
        Self::user(owner).child_unchecked("contactList")
    }

    /// `users/{owner}/contactList/{contact}`
    pub fn contact(owner: &UserId, contact: &UserId) -> Self {
        Self::contact_list(owner).child_unchecked(contact.as_str())
    }

    /// `groups`
    pub fn groups() -> Self {
        Self::root().child_unchecked("groups")
    }

    /// `groups/{id}`
    pub fn group(id: &GroupId) -> Self {
        Self::groups().child_unchecked(id.as_str())
    }

    /// `chats`
    pub fn chats() -> Self {
        Self::root().child_unchecked("chats")
    }

    /// `chats/{key}`
    pub fn chat(key: &ConversationKey) -> Self {
        Self::chats().child_unchecked(&key.to_string())
    }

    /// `chats/{key}/users`
    pub fn chat_users(key: &ConversationKey) -> Self {
        Self::chat(key).child_unchecked("users")
    }

    /// `chats/{key}/messages`
    pub fn messages(key: &ConversationKey) -> Self {
        Self::chat(key).child_unchecked("messages")
    }

    /// `chats/{key}/messages/{id}`
    pub fn message(key: &ConversationKey, id: &MessageId) -> Self {
        Self::messages(key).child_unchecked(id.as_str())
    }

    /// `chats/{key}/typingStates`
    pub fn typing_states(key: &ConversationKey) -> Self {
        Self::chat(key).child_unchecked("typingStates")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            f.write_str("/")
        } else {
            f.write_str(&self.segments.join("/"))
        }
    }
}

fn validate_segment(segment: &str) -> ChatResult<()> {
    if segment.is_empty() {
        return Err(ChatError::InvalidPath("empty path segment".to_string()));
    }
    if let Some(c) = segment
        .chars()
        .find(|c| FORBIDDEN_SEGMENT_CHARS.contains(c) || c.is_control())
    {
        return Err(ChatError::InvalidPath(format!(
            "segment {:?} contains forbidden character {:?}",
            segment, c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = StorePath::parse("/users/alice/contactList/").unwrap();
        assert_eq!(path.segments().len(), 3);
        assert_eq!(path.to_string(), "users/alice/contactList");
        assert_eq!(StorePath::parse("").unwrap(), StorePath::root());
        assert_eq!(StorePath::root().to_string(), "/");
    }

    #[test]
    fn test_forbidden_segments() {
        assert!(StorePath::parse("users/a.b").is_err());
        assert!(StorePath::root().child("a/b").is_err());
        assert!(StorePath::root().child("").is_err());
        assert!(StorePath::root().child("a#").is_err());
        // '~' is allowed in segments: conversation keys use it
        assert!(StorePath::root().child("a~b").is_ok());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let chats = StorePath::parse("chats/k").unwrap();
        let messages = StorePath::parse("chats/k/messages").unwrap();
        let other = StorePath::parse("chats/kk").unwrap();

        assert!(chats.contains(&messages));
        assert!(chats.contains(&chats));
        assert!(!messages.contains(&chats));
        assert!(messages.overlaps(&chats));
        assert!(!other.overlaps(&messages));
        assert!(StorePath::root().contains(&other));
    }

    #[test]
    fn test_parent_and_key() {
        let alice = UserId::new("alice").unwrap();
        let bob = UserId::new("bob").unwrap();
        let path = StorePath::contact(&alice, &bob);
        assert_eq!(path.to_string(), "users/alice/contactList/bob");
        assert_eq!(path.key(), Some("bob"));
        assert_eq!(path.parent().unwrap(), StorePath::contact_list(&alice));
        assert!(StorePath::root().parent().is_none());
    }

    #[test]
    fn test_conversation_paths() {
        let alice = UserId::new("alice").unwrap();
        let bob = UserId::new("bob").unwrap();
        let key = ConversationKey::direct(&bob, &alice).unwrap();
        assert_eq!(StorePath::messages(&key).to_string(), "chats/dm~alice~bob/messages");
        assert_eq!(
            StorePath::typing_states(&key).to_string(),
            "chats/dm~alice~bob/typingStates"
        );
        assert!(StorePath::chat(&key).contains(&StorePath::chat_users(&key)));
    }
}
