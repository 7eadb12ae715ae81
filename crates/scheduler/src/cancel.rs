//! Cooperative cancellation for fetches.
//!
//! A [`CancellationToken`] is shared between the requester's
//! [`FetchHandle`](crate::FetchHandle) and the worker executing the request.
//! Workers check it before starting and after the body arrives; a request
//! that is already on the wire is not interrupted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::FetchId;

/// Shared cancellation flag.
///
/// ```
/// use mapstream_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// token.cancel();
/// assert!(worker_token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; every clone observes the cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tokens of the fetches a fetcher currently owns, by id.
///
/// Lets the fetcher cancel everything outstanding when it shuts down.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<FetchId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token for `id` and returns a clone of it.
    pub fn register(&self, id: FetchId) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(id, token.clone());
        token
    }

    /// Returns `true` if `id` was registered.
    pub fn cancel(&self, id: FetchId) -> bool {
        match self.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every registered fetch and returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    /// Called once a fetch has delivered its result.
    pub fn unregister(&self, id: FetchId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FetchId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn test_registry_cancel_by_id() {
        let registry = CancellationRegistry::new();
        let first = registry.register(1);
        let second = registry.register(2);

        assert!(registry.cancel(1));
        assert!(!registry.cancel(99));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_registry_cancel_all() {
        let registry = CancellationRegistry::new();
        let tokens: Vec<_> = (0..3).map(|id| registry.register(id)).collect();

        assert_eq!(registry.cancel_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn test_registry_unregister() {
        let registry = CancellationRegistry::new();
        let token = registry.register(7);
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(7));
        assert!(!registry.unregister(7));
        assert!(registry.is_empty());

        // Unregistering does not cancel
        assert!(!token.is_cancelled());
        assert_eq!(registry.cancel_all(), 0);
    }
}
