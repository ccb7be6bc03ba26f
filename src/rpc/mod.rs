//! Connection demultiplexing, dispatch, forwarding, and blocking queries.
//!
//! ```text
//! listener ──▶ accept ──▶ demux (one frame byte)
//!                           ├── Rpc ───────▶ request-reply server
//!                           ├── Raft ──────▶ consensus transport handoff
//!                           ├── Tls ───────▶ upgrade, demux again
//!                           ├── MuxV1/V2 ──▶ yamux session ──▶ per-stream demux
//!                           └── Streaming ─▶ streaming carrier ──▶ handler
//! ```
//!
//! The forwarder and the blocking-query engine are invoked by handlers but
//! live here: they are the parts that couple the wire layer to consensus
//! leadership and to the indexed state store.

mod blocking;
mod codec;
mod context;
mod forward;
mod frame;
mod listener;
mod multiplex;
mod server;
mod streaming;
mod tls;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub use blocking::{QueryMeta, QueryOptions, blocking_query, set_query_meta};
pub use codec::{
    RequestHeader, ResponseHeader, StreamingRpcAck, StreamingRpcHeader, read_frame, read_message,
    write_frame, write_message,
};
pub use context::{BoxedConn, Conn, ConnContext};
pub use forward::{ConnectionPool, RpcInfo};
pub use frame::FrameTag;
pub use server::{RpcDispatcher, RpcHandlerFn};
pub use streaming::{StreamingHandler, StreamingRegistry, open_streaming, open_streaming_on};
pub use tls::{RegionTlsWrap, TlsWrap, cert_identity};

use crate::cluster::{NodeConnRegistry, Peer, PeerDirectory};
use crate::config::{ConfigError, RpcConfig};
use crate::consensus::{self, MessageType, RaftHandle};
use crate::errors::RpcError;
use crate::metrics::RpcMetrics;

/// The RPC core of one server: owns the inbound wire handling and the
/// forwarding/blocking-query engines handlers call back into.
pub struct RpcHandler {
    pub(crate) config: Arc<RpcConfig>,
    pub(crate) raft: Arc<dyn RaftHandle>,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) peers: Arc<PeerDirectory>,
    pub(crate) node_conns: Arc<NodeConnRegistry>,
    pub(crate) dispatcher: Arc<RpcDispatcher>,
    pub(crate) streaming: Arc<StreamingRegistry>,
    pub(crate) metrics: Arc<RpcMetrics>,
    tls: RwLock<Option<TlsAcceptor>>,
    tls_wrap: RwLock<Option<Arc<dyn TlsWrap>>>,
    pub(crate) shutdown: CancellationToken,
}

impl std::fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandler")
            .field("region", &self.config.region)
            .field("methods", &self.dispatcher.len())
            .field("streaming_methods", &self.streaming.len())
            .finish()
    }
}

impl RpcHandler {
    /// Start building an `RpcHandler` from its required collaborators.
    pub fn builder(
        config: RpcConfig,
        raft: Arc<dyn RaftHandle>,
        pool: Arc<dyn ConnectionPool>,
    ) -> RpcHandlerBuilder {
        RpcHandlerBuilder {
            config,
            raft,
            pool,
            peers: None,
            node_conns: None,
            dispatcher: RpcDispatcher::new(),
            streaming: StreamingRegistry::new(),
            metrics: None,
            tls: None,
            tls_wrap: None,
            shutdown: None,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Peer directory fed by membership events.
    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    /// Node-identity to connection registry.
    pub fn node_conns(&self) -> &Arc<NodeConnRegistry> {
        &self.node_conns
    }

    /// Counters maintained by the core.
    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.metrics
    }

    /// Token that stops the listener, session loops, and leader gates.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Current inbound TLS acceptor, if configured.
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.read().clone()
    }

    /// Rotate the inbound TLS acceptor (certificate reload).
    pub fn set_tls_acceptor(&self, acceptor: Option<TlsAcceptor>) {
        *self.tls.write() = acceptor;
    }

    /// Current outbound TLS wrapper, if configured.
    pub fn tls_wrap(&self) -> Option<Arc<dyn TlsWrap>> {
        self.tls_wrap.read().clone()
    }

    /// Rotate the outbound TLS wrapper (certificate reload).
    pub fn set_tls_wrap(&self, wrap: Option<Arc<dyn TlsWrap>>) {
        *self.tls_wrap.write() = wrap;
    }

    /// Encode `msg`, submit it to consensus, and return the state-machine
    /// response and replicated index.
    pub async fn raft_apply<T: Serialize + Sync>(
        &self,
        t: MessageType,
        msg: &T,
    ) -> Result<(Vec<u8>, u64), RpcError> {
        consensus::raft_apply(
            self.raft.as_ref(),
            t,
            msg,
            self.config.raft_warn_size,
            self.config.enqueue_limit,
        )
        .await
    }

    /// Dial `peer` and open a streaming RPC for `method`. The returned
    /// connection belongs to the caller.
    pub async fn streaming_rpc(&self, peer: &Peer, method: &str) -> anyhow::Result<BoxedConn> {
        streaming::open_streaming(self.tls_wrap(), peer.rpc_addr, &peer.region, method).await
    }

    /// Open a streaming RPC for `method` on a pre-established connection
    /// to a server of `region`.
    pub async fn streaming_rpc_on(
        &self,
        conn: BoxedConn,
        region: &str,
        method: &str,
    ) -> anyhow::Result<BoxedConn> {
        streaming::open_streaming_on(self.tls_wrap(), conn, region, method).await
    }
}

/// Builder for [`RpcHandler`].
pub struct RpcHandlerBuilder {
    config: RpcConfig,
    raft: Arc<dyn RaftHandle>,
    pool: Arc<dyn ConnectionPool>,
    peers: Option<Arc<PeerDirectory>>,
    node_conns: Option<Arc<NodeConnRegistry>>,
    dispatcher: RpcDispatcher,
    streaming: StreamingRegistry,
    metrics: Option<Arc<RpcMetrics>>,
    tls: Option<TlsAcceptor>,
    tls_wrap: Option<Arc<dyn TlsWrap>>,
    shutdown: Option<CancellationToken>,
}

impl RpcHandlerBuilder {
    /// Use a shared peer directory instead of a fresh one.
    pub fn peers(mut self, peers: Arc<PeerDirectory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Use a shared node-connection registry.
    pub fn node_conns(mut self, node_conns: Arc<NodeConnRegistry>) -> Self {
        self.node_conns = Some(node_conns);
        self
    }

    /// Register a request-reply handler.
    pub fn rpc_method(
        mut self,
        method: impl Into<String>,
        handler: RpcHandlerFn,
    ) -> anyhow::Result<Self> {
        self.dispatcher.register(method, handler)?;
        Ok(self)
    }

    /// Register a streaming handler.
    pub fn streaming_method(
        mut self,
        method: impl Into<String>,
        handler: StreamingHandler,
    ) -> anyhow::Result<Self> {
        self.streaming.register(method, handler)?;
        Ok(self)
    }

    /// Use shared counters instead of fresh ones.
    pub fn metrics(mut self, metrics: Arc<RpcMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Configure the inbound TLS acceptor.
    pub fn tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Configure the outbound TLS wrapper.
    pub fn tls_wrap(mut self, wrap: Arc<dyn TlsWrap>) -> Self {
        self.tls_wrap = Some(wrap);
        self
    }

    /// Use an externally owned shutdown token.
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Validate the configuration and assemble the handler.
    pub fn build(self) -> Result<Arc<RpcHandler>, ConfigError> {
        self.config.validate()?;
        let peers = self
            .peers
            .unwrap_or_else(|| Arc::new(PeerDirectory::new(self.config.region.clone())));
        Ok(Arc::new(RpcHandler {
            config: Arc::new(self.config),
            raft: self.raft,
            pool: self.pool,
            peers,
            node_conns: self.node_conns.unwrap_or_default(),
            dispatcher: Arc::new(self.dispatcher),
            streaming: Arc::new(self.streaming),
            metrics: self.metrics.unwrap_or_default(),
            tls: RwLock::new(self.tls),
            tls_wrap: RwLock::new(self.tls_wrap),
            shutdown: self.shutdown.unwrap_or_default(),
        }))
    }
}

/// A uniformly random duration in `[0, base)`, used to stagger retries so
/// a fleet does not thunder in step. Zero in, zero out.
pub(crate) fn random_stagger(base: Duration) -> Duration {
    use rand::Rng;

    if base.is_zero() {
        return Duration::ZERO;
    }
    let nanos = base.as_nanos().min(u64::MAX as u128) as u64;
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_stagger_stays_in_range() {
        assert_eq!(random_stagger(Duration::ZERO), Duration::ZERO);
        let base = Duration::from_millis(40);
        for _ in 0..128 {
            assert!(random_stagger(base) < base);
        }
    }
}
