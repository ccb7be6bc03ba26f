//! Larch library entry point.
//!
//! Larch is the server-side RPC core of a region-partitioned cluster: every
//! voting server demultiplexes a single listening port into sub-protocols
//! (request-reply RPC, consensus handoff, stream multiplexing, TLS upgrade,
//! streaming RPC), forwards requests to the right region or the local
//! leader, and answers consistent-with-index blocking queries against the
//! replicated state.
//!
//! The consensus engine, the indexed state store, and the outbound
//! connection pool are collaborators reached through traits
//! ([`consensus::RaftHandle`], [`state::StateSource`],
//! [`rpc::ConnectionPool`]); this crate owns the wire handling between them.

#![warn(missing_docs)]

/// Cluster membership state: peer directory and node-connection registry.
pub mod cluster;
/// Configuration consumed by the RPC core.
pub mod config;
/// Consensus submission: entry encoding and the apply helper.
pub mod consensus;
/// Fixed protocol and query bounds.
pub mod constants;
/// Error types surfaced by the RPC core.
pub mod errors;
/// Injected request counters.
pub mod metrics;
/// Connection demultiplexing, dispatch, forwarding, and blocking queries.
pub mod rpc;
/// State-store traits and watch sets for blocking queries.
pub mod state;

pub use cluster::{NodeConnRegistry, Peer, PeerDirectory};
pub use config::RpcConfig;
pub use consensus::{Applied, MessageType, RaftHandle};
pub use errors::RpcError;
pub use metrics::{MetricsSnapshot, RpcMetrics};
pub use rpc::{
    BoxedConn, ConnContext, ConnectionPool, FrameTag, QueryMeta, QueryOptions, RpcDispatcher,
    RpcHandler, RpcInfo, StreamingRegistry,
};
pub use state::{StateSource, WatchOutcome, WatchSet, WatchableStore};
