use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::IdentityService;
use crate::error::{ChatError, ChatResult};
use crate::storage::{Storage, StoredAccount};
use crate::types::UserId;

const MIN_PASSWORD_LEN: usize = 6;

enum Accounts {
    Memory(Mutex<HashMap<String, StoredAccount>>),
    Persistent(Storage),
}

/// Local credential service.
///
/// Accounts are keyed by normalized email (trimmed, lowercased). With
/// [`LocalIdentity::open`] accounts and the session survive restarts.
pub struct LocalIdentity {
    accounts: Accounts,
    session: RwLock<Option<UserId>>,
    ids: Mutex<ulid::Generator>,
}

impl LocalIdentity {
    /// Accounts kept in memory only
    pub fn in_memory() -> Self {
        Self {
            accounts: Accounts::Memory(Mutex::new(HashMap::new())),
            session: RwLock::new(None),
            ids: Mutex::new(ulid::Generator::new()),
        }
    }

    /// Accounts and session persisted in `storage`; restores the last session.
    pub fn open(storage: Storage) -> ChatResult<Self> {
        let session = storage
            .load_session()?
            .and_then(|id| UserId::new(id).ok());
        if let Some(user) = &session {
            debug!(%user, "Restored session");
        }
        Ok(Self {
            accounts: Accounts::Persistent(storage),
            session: RwLock::new(session),
            ids: Mutex::new(ulid::Generator::new()),
        })
    }

    fn load(&self, email: &str) -> ChatResult<Option<StoredAccount>> {
        match &self.accounts {
            Accounts::Memory(map) => Ok(map.lock().get(email).cloned()),
            Accounts::Persistent(storage) => storage.load_account(email),
        }
    }

    fn save(&self, email: &str, account: &StoredAccount) -> ChatResult<()> {
        match &self.accounts {
            Accounts::Memory(map) => {
                map.lock().insert(email.to_string(), account.clone());
                Ok(())
            }
            Accounts::Persistent(storage) => storage.save_account(email, account),
        }
    }

    fn set_session(&self, user: Option<UserId>) -> ChatResult<()> {
        if let Accounts::Persistent(storage) = &self.accounts {
            storage.save_session(user.as_ref().map(UserId::as_str))?;
        }
        *self.session.write() = user;
        Ok(())
    }
}

fn normalize_email(email: &str) -> ChatResult<String> {
    let email = email.trim().to_lowercase();
    let valid = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.ends_with('.'))
        .unwrap_or(false);
    if !valid {
        return Err(ChatError::AuthFailed(
            "The email address is badly formatted.".to_string(),
        ));
    }
    Ok(email)
}

fn no_such_user() -> ChatError {
    ChatError::AuthFailed(
        "There is no user record corresponding to this identifier.".to_string(),
    )
}

#[async_trait]
impl IdentityService for LocalIdentity {
    async fn sign_in(&self, email: &str, password: &str) -> ChatResult<UserId> {
        let email = normalize_email(email)?;
        let account = self.load(&email)?.ok_or_else(no_such_user)?;
        if !account.verify(password) {
            return Err(ChatError::AuthFailed(
                "The password is invalid or the user does not have a password.".to_string(),
            ));
        }
        let user = UserId::new(account.user_id)?;
        self.set_session(Some(user.clone()))?;
        info!(%user, "Signed in");
        Ok(user)
    }

    async fn sign_up(&self, email: &str, password: &str) -> ChatResult<UserId> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ChatError::AuthFailed(format!(
                "Password should be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        if self.load(&email)?.is_some() {
            return Err(ChatError::AuthFailed(
                "The email address is already in use by another account.".to_string(),
            ));
        }

        let raw_id = self
            .ids
            .lock()
            .generate()
            .map_err(|e| ChatError::Storage(format!("user id allocation: {}", e)))?;
        let user = UserId::new(raw_id.to_string())?;
        self.save(&email, &StoredAccount::new(user.as_str(), password))?;
        self.set_session(Some(user.clone()))?;
        info!(%user, "Account registered");
        Ok(user)
    }

    async fn sign_out(&self) -> ChatResult<()> {
        let previous = self.session.read().clone();
        self.set_session(None)?;
        if let Some(user) = previous {
            info!(%user, "Signed out");
        }
        Ok(())
    }

    fn current_user(&self) -> Option<UserId> {
        self.session.read().clone()
    }

    async fn send_password_reset(&self, email: &str) -> ChatResult<()> {
        let email = normalize_email(email)?;
        if self.load(&email)?.is_none() {
            return Err(no_such_user());
        }
        // No mail transport locally; the request is only logged
        info!(%email, "Password reset requested");
        Ok(())
    }
}
