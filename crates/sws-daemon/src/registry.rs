//! Process-wide set of live subscriptions.

use std::sync::{Arc, Mutex};

use crate::subscription::Subscription;

/// Mutex-guarded registry. Lookups and mutations are short; nothing
/// async happens under the lock.
#[derive(Default)]
pub struct Registry {
    subs: Mutex<Vec<Arc<Subscription>>>,
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live subscription.
    pub fn add(&self, sub: Arc<Subscription>) {
        self.lock().push(sub);
    }

    /// Remove a subscription by identity.
    pub fn remove(&self, sub: &Subscription) {
        self.lock().retain(|other| other.sub_id != sub.sub_id);
    }

    /// Find the live subscription bound to a key, if any.
    ///
    /// Subscriptions that have not bootstrapped yet are not bound to a
    /// key and never match.
    #[must_use]
    pub fn find_by_key_id(&self, key_id: &str) -> Option<Arc<Subscription>> {
        self.lock()
            .iter()
            .find(|sub| sub.boot().is_some_and(|boot| boot.key_id == key_id))
            .cloned()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Subscription>>> {
        self.subs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
