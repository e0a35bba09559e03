//! External collaborators consumed by the engine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  IdentityService   credential issuance and the current session  │
//! │  ObjectStorage     attachment / avatar upload → durable URI     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Local implementations back the CLI and the tests: [`LocalIdentity`]
//! keeps salted password digests in redb, [`BlobObjectStorage`] keeps
//! content-addressed blobs. Both also run purely in memory.

mod identity;
mod objects;

pub use identity::LocalIdentity;
pub use objects::{BlobObjectStorage, BLOB_URI_SCHEME};

use async_trait::async_trait;

use crate::error::ChatResult;
use crate::types::UserId;

/// Credential service.
///
/// Every rejection is a [`ChatError::AuthFailed`](crate::ChatError::AuthFailed)
/// carrying the service's own message.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Authenticate and start a session
    async fn sign_in(&self, email: &str, password: &str) -> ChatResult<UserId>;

    /// Register a credential and start a session
    async fn sign_up(&self, email: &str, password: &str) -> ChatResult<UserId>;

    /// End the current session. No-op without one.
    async fn sign_out(&self) -> ChatResult<()>;

    /// User of the current session, if any
    fn current_user(&self) -> Option<UserId>;

    /// Ask the service to send a password reset to `email`
    async fn send_password_reset(&self, email: &str) -> ChatResult<()>;
}

/// Binary object storage for attachments and avatars.
///
/// Failures are [`ChatError::UploadFailed`](crate::ChatError::UploadFailed).
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` and return a durable public URI.
    async fn upload(&self, bytes: Vec<u8>, content_type: &str, name: &str) -> ChatResult<String>;
}
