//! State-store traits and watch sets.
//!
//! The indexed state store is a collaborator: the blocking-query engine
//! only needs to re-fetch the current store (it can be wholesale replaced
//! by a snapshot restore), take a cheap snapshot, and subscribe to the
//! abandon signal that fires when a restore invalidates every open watch.
//! Queries register additional change channels on a [`WatchSet`] while they
//! run; the engine then waits on the whole set with a deadline.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Source of the current state store.
///
/// `state()` must be called per query iteration rather than cached: a
/// snapshot restore swaps the store, and the old store's abandon channel is
/// what wakes waiters so they can re-fetch.
pub trait StateSource: Send + Sync {
    /// Store type this source hands out.
    type Store: WatchableStore;

    /// The current store.
    fn state(&self) -> Arc<Self::Store>;
}

/// A state store the blocking-query engine can snapshot and watch.
pub trait WatchableStore: Send + Sync {
    /// Cheap consistent read view of the store.
    type Snapshot;

    /// Take a snapshot.
    fn snapshot(&self) -> Self::Snapshot;

    /// Channel that fires when this store is abandoned (replaced by a
    /// snapshot restore).
    fn abandon_watch(&self) -> watch::Receiver<()>;
}

/// Outcome of waiting on a watch set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Some watched channel fired; re-run the query.
    Fired,
    /// The deadline passed (or shutdown began) with no change.
    Deadline,
}

/// An aggregation of change channels that signals when any of them fires.
#[derive(Debug, Default)]
pub struct WatchSet {
    watches: Vec<watch::Receiver<()>>,
}

impl WatchSet {
    /// Create an empty watch set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel to the set. A channel whose sender is already gone
    /// counts as fired.
    pub fn add(&mut self, rx: watch::Receiver<()>) {
        self.watches.push(rx);
    }

    /// Number of channels in the set.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Whether the set holds no channels.
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Wait until any channel fires, the deadline passes, or shutdown
    /// begins. Shutdown reports as [`WatchOutcome::Deadline`]: the caller
    /// returns whatever data it has, same as a timeout.
    pub async fn wait(&mut self, deadline: Instant, shutdown: &CancellationToken) -> WatchOutcome {
        if self.watches.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => WatchOutcome::Deadline,
                _ = shutdown.cancelled() => WatchOutcome::Deadline,
            }
        } else {
            let any_fired = futures::future::select_all(self.watches.iter_mut().map(|rx| {
                Box::pin(async move {
                    // A closed sender means the watched object is gone,
                    // which is a change as far as the query is concerned.
                    let _ = rx.changed().await;
                })
            }));
            tokio::select! {
                _ = any_fired => WatchOutcome::Fired,
                _ = tokio::time::sleep_until(deadline) => WatchOutcome::Deadline,
                _ = shutdown.cancelled() => WatchOutcome::Deadline,
            }
        }
    }
}
