//! Identity provider seam
//!
//! The engine only needs to know who is signed in and when that changes;
//! credentials and sign-in flows live outside this crate.

use crate::models::User;
use tokio::sync::watch;

/// Source of the signed-in principal
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<User>;

    fn current_user_id(&self) -> Option<String> {
        self.current_user().map(|u| u.id)
    }

    /// Receiver that changes whenever the signed-in user changes
    fn subscribe(&self) -> watch::Receiver<Option<User>>;
}

/// Identity backed by a `watch` channel; the host app calls [`set_user`](Self::set_user)
#[derive(Debug)]
pub struct WatchIdentity {
    tx: watch::Sender<Option<User>>,
}

impl WatchIdentity {
    pub fn new(initial: Option<User>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the signed-in user; a no-op when the same user is set again
    pub fn set_user(&self, user: Option<User>) {
        self.tx.send_if_modified(|current| {
            if *current == user {
                return false;
            }
            *current = user;
            true
        });
    }
}

impl Default for WatchIdentity {
    fn default() -> Self {
        Self::new(None)
    }
}

impl IdentityProvider for WatchIdentity {
    fn current_user(&self) -> Option<User> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.tx.subscribe()
    }
}
