//! Blocking queries.
//!
//! A query that names a minimum index runs once and, if the reply index
//! has not passed that minimum, parks on a watch set until the state it
//! read changes, the snapshot is abandoned, or the (clamped, jittered)
//! wait expires. Expiry is not an error: the engine returns the last
//! result it produced, and the caller tells "no change" from the reply
//! index alone.
//!
//! The query function receives a snapshot, never the live store: a
//! snapshot restore mid-query swaps the store wholesale, and the abandon
//! channel seeded into every watch set wakes the waiter so the next
//! iteration re-captures the current store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RpcConfig;
use crate::consensus::RaftHandle;
use crate::metrics::RpcMetrics;
use crate::rpc::forward::RpcInfo;
use crate::rpc::{RpcHandler, random_stagger};
use crate::state::{StateSource, WatchOutcome, WatchSet, WatchableStore};

/// Request-side options of a (possibly blocking) query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Region the query targets.
    pub region: String,
    /// Index the reply must exceed before returning; 0 disables blocking.
    pub min_query_index: u64,
    /// Requested maximum wait; clamped into the configured bounds.
    pub max_query_time: Duration,
    /// Whether a follower-local read is acceptable.
    pub allow_stale: bool,
    /// Set when a server relays the query.
    pub forwarded: bool,
}

impl RpcInfo for QueryOptions {
    fn request_region(&self) -> &str {
        &self.region
    }

    fn is_read(&self) -> bool {
        true
    }

    fn allow_stale_read(&self) -> bool {
        self.allow_stale
    }

    fn set_forwarded(&mut self) {
        self.forwarded = true;
    }
}

/// Reply-side metadata of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Index the reply reflects.
    pub index: u64,
    /// How long ago this server heard from the leader; zero on the leader
    /// itself, [`Duration::MAX`] before any contact.
    pub last_contact: Duration,
    /// Whether a leader is currently known.
    pub known_leader: bool,
}

/// Populate the leadership fields of a reply's metadata.
pub fn set_query_meta(raft: &dyn RaftHandle, meta: &mut QueryMeta) {
    if raft.is_leader() {
        meta.last_contact = Duration::ZERO;
        meta.known_leader = true;
    } else {
        meta.last_contact = raft
            .last_contact()
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        meta.known_leader = raft.leader_addr().is_some();
    }
}

/// Run a query, blocking for fresh data when the caller asked for it.
///
/// `run` is invoked with a watch set (`None` for non-blocking queries), a
/// snapshot of the current store, and the reply metadata it must populate:
/// on return, `meta.index` must be at least the store index the snapshot
/// reflected. The engine re-runs it with a fresh snapshot and watch set
/// every time the set fires before the deadline.
#[allow(clippy::too_many_arguments)]
pub async fn blocking_query<Src, S, F, E>(
    raft: &dyn RaftHandle,
    source: &Src,
    config: &RpcConfig,
    metrics: &RpcMetrics,
    shutdown: &CancellationToken,
    opts: &QueryOptions,
    meta: &mut QueryMeta,
    mut run: F,
) -> Result<(), E>
where
    Src: StateSource<Store = S> + ?Sized,
    S: WatchableStore,
    F: FnMut(Option<&mut WatchSet>, &S::Snapshot, &mut QueryMeta) -> Result<(), E>,
{
    let blocking = opts.min_query_index > 0;

    let deadline = if blocking {
        let mut wait = opts.max_query_time;
        if wait > config.max_query_time {
            wait = config.max_query_time;
        } else if wait.is_zero() {
            wait = config.default_query_time;
        }
        wait += random_stagger(wait / config.jitter_fraction);
        Instant::now() + wait
    } else {
        Instant::now()
    };

    loop {
        set_query_meta(raft, meta);
        metrics.incr_query();

        // Capture the current store each iteration; a snapshot restore
        // replaces it, and the abandon channel below is what gets us here
        // again to pick up the replacement.
        let store = source.state();
        let mut ws = if blocking {
            let mut ws = WatchSet::new();
            ws.add(store.abandon_watch());
            Some(ws)
        } else {
            None
        };
        let snap = store.snapshot();

        run(ws.as_mut(), &snap, meta)?;

        if !blocking || meta.index > opts.min_query_index {
            return Ok(());
        }
        let Some(mut ws) = ws else {
            return Ok(());
        };
        match ws.wait(deadline, shutdown).await {
            WatchOutcome::Fired => continue,
            WatchOutcome::Deadline => return Ok(()),
        }
    }
}

impl RpcHandler {
    /// Populate the leadership fields of a reply's metadata.
    pub fn set_query_meta(&self, meta: &mut QueryMeta) {
        set_query_meta(self.raft.as_ref(), meta);
    }

    /// Run a query against `source`, blocking for fresh data when the
    /// options ask for it. See [`blocking_query`].
    pub async fn blocking_query<Src, S, F, E>(
        &self,
        source: &Src,
        opts: &QueryOptions,
        meta: &mut QueryMeta,
        run: F,
    ) -> Result<(), E>
    where
        Src: StateSource<Store = S> + ?Sized,
        S: WatchableStore,
        F: FnMut(Option<&mut WatchSet>, &S::Snapshot, &mut QueryMeta) -> Result<(), E>,
    {
        blocking_query(
            self.raft.as_ref(),
            source,
            &self.config,
            &self.metrics,
            &self.shutdown,
            opts,
            meta,
            run,
        )
        .await
    }
}
