//! Cooperative cancellation shared between a caller and in-flight execution.
//!
//! A token starts pending and can be cancelled exactly once. Listeners
//! registered before cancellation run synchronously inside `cancel()`, in
//! registration order; listeners registered afterwards run immediately.
//! Registration returns a guard that removes the listener when dropped,
//! so a callback scoped to one command can never fire for a later one.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Listener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct State {
    cancelled: bool,
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Listeners run outside the lock, so a poisoned mutex still holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shareable cancellation signal. Clones observe and control the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token, firing every registered listener once.
    ///
    /// Idempotent: only the first call has any effect.
    pub fn cancel(&self) {
        let listeners = {
            let mut state = self.inner.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.listeners)
        };

        for (_, listener) in listeners {
            listener();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Register `callback` to run on cancellation.
    ///
    /// If the token is already cancelled the callback runs before this
    /// returns. Dropping the returned guard deregisters the callback if it
    /// has not fired yet.
    pub fn on_cancel<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.cancelled {
            drop(state);
            callback();
            return CancellationRegistration {
                inner: Arc::clone(&self.inner),
                id: None,
            };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, Box::new(callback)));

        CancellationRegistration {
            inner: Arc::clone(&self.inner),
            id: Some(id),
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Keeps a cancellation listener registered for as long as it lives.
#[must_use = "dropping the registration removes the listener immediately"]
pub struct CancellationRegistration {
    inner: Arc<Inner>,
    id: Option<u64>,
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.inner.lock().listeners.retain(|(lid, _)| *lid != id);
        }
    }
}
