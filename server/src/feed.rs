//! Change feed wake-ups.
//!
//! Feed requests are long polls: a request with nothing new to return parks
//! on its table's notifier until a write to that table commits or its wait
//! runs out. The rows themselves are always read from the database.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

/// Per-table notifiers, shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct FeedHub {
    tables: DashMap<String, Arc<Notify>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// Create a new hub wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Notifier of `table`, created on first use.
    pub fn notifier(&self, table: &str) -> Arc<Notify> {
        if let Some(notify) = self.tables.get(table) {
            return Arc::clone(notify.value());
        }
        Arc::clone(self.tables.entry(table.to_string()).or_default().value())
    }

    /// Wake every poll parked on `table`. Call after the write committed.
    pub fn publish(&self, table: &str) {
        if let Some(notify) = self.tables.get(table) {
            notify.notify_waiters();
            tracing::debug!(table = %table, "woke feed listeners");
        }
    }
}
