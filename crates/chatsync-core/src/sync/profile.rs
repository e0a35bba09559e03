//! Live snapshot of one user's profile (chat headers, "who am I")

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::events::ChatEvent;
use super::shared::SharedSubscription;
use super::SyncContext;
use crate::error::ChatResult;
use crate::store::StorePath;
use crate::types::{UserId, UserProfile};

/// Watches `users/{id}`. `None` while the profile does not exist.
///
/// Shares the `users/{id}` listener with any directory referencing the user.
pub struct ProfileSync {
    user: UserId,
    tx: Arc<watch::Sender<Option<UserProfile>>>,
    subscription: SharedSubscription,
}

impl ProfileSync {
    pub fn start(ctx: &SyncContext, user: &UserId) -> ChatResult<Self> {
        let (tx, _) = watch::channel(None);
        let tx = Arc::new(tx);
        let publisher = tx.clone();
        let events = ctx.clone();
        let id = user.clone();
        let subscription = ctx.subscribe_shared(StorePath::user(user), move |value| {
            let profile = value.as_ref().and_then(UserProfile::from_value);
            let changed = publisher.send_if_modified(|current| {
                if *current == profile {
                    return false;
                }
                *current = profile;
                true
            });
            if changed {
                debug!(user = %id, "Profile changed");
                events.emit(ChatEvent::ProfileChanged { user: id.clone() });
            }
        })?;
        Ok(Self {
            user: user.clone(),
            tx,
            subscription,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Current profile, `None` if absent
    pub fn snapshot(&self) -> Option<UserProfile> {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<UserProfile>> {
        self.tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().as_ref().map(|p| p.online).unwrap_or(false)
    }

    pub fn stop(&self) {
        self.subscription.cancel();
    }
}
