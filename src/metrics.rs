//! Injected request counters.
//!
//! The core never talks to a metrics sink; it increments counters on an
//! `RpcMetrics` the embedding server passes in, and the server scrapes a
//! [`MetricsSnapshot`] on its own schedule. No global registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Counters maintained by the RPC core.
#[derive(Debug, Default)]
pub struct RpcMetrics {
    /// Physical connections accepted by the listener.
    accept_conn: AtomicU64,
    /// Connections handed off to the consensus transport.
    raft_handoff: AtomicU64,
    /// Request-reply RPCs served successfully.
    request: AtomicU64,
    /// Request-reply transport errors (EOF and close excluded).
    request_error: AtomicU64,
    /// Query executions, counting each blocking re-run.
    query: AtomicU64,
    /// Streaming RPCs dispatched to a handler.
    streaming_request: AtomicU64,
    /// Streaming RPC failures before dispatch.
    streaming_request_error: AtomicU64,
    /// RPCs forwarded out of the local region, by target region.
    cross_region: DashMap<String, AtomicU64>,
}

impl RpcMetrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr_accept_conn(&self) {
        self.accept_conn.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_raft_handoff(&self) {
        self.raft_handoff.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_request(&self) {
        self.request.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_request_error(&self) {
        self.request_error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_query(&self) {
        self.query.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_streaming_request(&self) {
        self.streaming_request.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_streaming_request_error(&self) {
        self.streaming_request_error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_cross_region(&self, region: &str) {
        self.cross_region
            .entry(region.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Copy out the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accept_conn: self.accept_conn.load(Ordering::Relaxed),
            raft_handoff: self.raft_handoff.load(Ordering::Relaxed),
            request: self.request.load(Ordering::Relaxed),
            request_error: self.request_error.load(Ordering::Relaxed),
            query: self.query.load(Ordering::Relaxed),
            streaming_request: self.streaming_request.load(Ordering::Relaxed),
            streaming_request_error: self.streaming_request_error.load(Ordering::Relaxed),
            cross_region: self
                .cross_region
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Point-in-time view of [`RpcMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Physical connections accepted.
    pub accept_conn: u64,
    /// Consensus transport handoffs.
    pub raft_handoff: u64,
    /// Request-reply RPCs served.
    pub request: u64,
    /// Request-reply transport errors.
    pub request_error: u64,
    /// Query executions.
    pub query: u64,
    /// Streaming RPCs dispatched.
    pub streaming_request: u64,
    /// Streaming RPC failures.
    pub streaming_request_error: u64,
    /// Cross-region forwards by target region.
    pub cross_region: HashMap<String, u64>,
}
