//! Error listener registry.
//!
//! Failures surfaced by reconciliation sessions are reported synchronously
//! to every registered listener, in registration order. Registration
//! returns an [`Unsubscribe`] handle.

use crate::error::SyncError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Listener = Arc<dyn Fn(&SyncError) + Send + Sync>;

#[derive(Default)]
struct Table {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Shared set of error listeners. Clones share the same registry.
#[derive(Clone, Default)]
pub struct ErrorListeners {
    table: Arc<Mutex<Table>>,
}

impl ErrorListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` until the returned handle is used to remove it.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        let mut table = lock(&self.table);
        let id = table.next_id;
        table.next_id += 1;
        table.listeners.push((id, Arc::new(listener)));
        Unsubscribe {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Report `error` to every listener. Returns how many were called.
    pub fn notify(&self, error: &SyncError) -> usize {
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let listeners: Vec<Listener> = lock(&self.table)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &listeners {
            listener(error);
        }
        listeners.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ErrorListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorListeners")
            .field("len", &self.len())
            .finish()
    }
}

/// Handle removing one listener.
#[derive(Debug)]
#[must_use = "dropping the handle keeps the listener registered"]
pub struct Unsubscribe {
    id: u64,
    table: Weak<Mutex<Table>>,
}

impl Unsubscribe {
    /// Remove the listener. A no-op once the registry is gone.
    pub fn unsubscribe(self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    // A panicking listener never holds the lock, so the table stays valid.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
