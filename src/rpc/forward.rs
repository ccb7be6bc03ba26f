//! Request forwarding.
//!
//! A handler passes every request through [`RpcHandler::forward`] first.
//! The outcome tells it whether the request was dispatched remotely (to
//! another region, or to the local region's leader) or should run locally.
//! When the local region has no leader yet, the forwarder gates the
//! request behind a jittered retry loop bounded by the configured hold
//! timeout, so requests racing a leader election usually win instead of
//! failing.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::time::Instant;
use tracing::warn;

use crate::cluster::Peer;
use crate::errors::{DecodeSnafu, EncodeSnafu, NoRegionPathSnafu, RpcError};
use crate::rpc::{RpcHandler, random_stagger};

/// Request metadata the forwarder reads and marks.
pub trait RpcInfo {
    /// Region the request targets; empty means the request is malformed.
    fn request_region(&self) -> &str;

    /// Whether the request only reads state.
    fn is_read(&self) -> bool;

    /// Whether the caller tolerates a stale (follower-local) read.
    fn allow_stale_read(&self) -> bool;

    /// Mark that a server relayed this request, preventing forwarding
    /// loops on the receiving side.
    fn set_forwarded(&mut self);
}

/// Outbound connection pool keyed by (region, address, major version).
///
/// The pool owns connection reuse, the streaming/multiplexing of its own
/// client connections, and retries; the forwarder hands it encoded
/// arguments and decodes the reply.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Send one request-reply RPC and return the encoded response.
    async fn rpc(
        &self,
        region: &str,
        addr: SocketAddr,
        major_version: u8,
        method: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, RpcError>;
}

/// Where the local region's leader was found, if anywhere.
pub(crate) enum LeaderLookup {
    /// This server is the leader.
    Local,
    /// A remote peer is the leader.
    Remote(Arc<Peer>),
    /// No leader is known yet, or the leader is not in the peer directory.
    Unknown,
}

impl RpcHandler {
    /// Forward a request if it should not run locally.
    ///
    /// Returns `Ok(false)` when the caller must execute the request
    /// locally (this server leads, or the caller allows stale reads), and
    /// `Ok(true)` when the request was dispatched remotely. An `Err` also
    /// means the caller must not execute it: the request was handled here
    /// but failed, with no target region, no path to the region, or no
    /// leader within the hold timeout.
    pub async fn forward<A, R>(
        &self,
        method: &str,
        args: &mut A,
        reply: &mut R,
    ) -> Result<bool, RpcError>
    where
        A: RpcInfo + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        let region = args.request_region().to_string();
        if region.is_empty() {
            return Err(RpcError::MissingRegion);
        }

        if region != self.config.region {
            args.set_forwarded();
            self.forward_region(&region, method, args, reply).await?;
            return Ok(true);
        }

        if args.is_read() && args.allow_stale_read() {
            return Ok(false);
        }

        // Gate on leadership. The clock starts at the first failed lookup,
        // not at entry, so the total wait is bounded by the hold timeout.
        let mut first_check: Option<Instant> = None;
        loop {
            match self.get_leader() {
                LeaderLookup::Local => return Ok(false),
                LeaderLookup::Remote(leader) => {
                    args.set_forwarded();
                    self.forward_leader(Some(leader.as_ref()), method, args, reply)
                        .await?;
                    return Ok(true);
                }
                LeaderLookup::Unknown => {}
            }

            let first = *first_check.get_or_insert_with(Instant::now);
            if first.elapsed() >= self.config.hold_timeout {
                break;
            }
            let jitter = random_stagger(self.config.hold_timeout / self.config.jitter_fraction);
            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        Err(RpcError::NoLeader)
    }

    /// Locate the local region's leader: this server, a known peer, or
    /// nobody (no election yet, or membership has not observed the leader).
    pub(crate) fn get_leader(&self) -> LeaderLookup {
        if self.raft.is_leader() {
            return LeaderLookup::Local;
        }
        let Some(addr) = self.raft.leader_addr() else {
            return LeaderLookup::Unknown;
        };
        match self.peers.local_peer(&addr) {
            Some(peer) => LeaderLookup::Remote(peer),
            None => LeaderLookup::Unknown,
        }
    }

    /// Forward an RPC to a random server of `region`.
    pub async fn forward_region<A, R>(
        &self,
        region: &str,
        method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<(), RpcError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let Some(server) = self.peers.pick_region_server(region) else {
            warn!(region, "no path found to region");
            return NoRegionPathSnafu { region }.fail();
        };
        self.metrics.incr_cross_region(region);
        self.pool_rpc(region, &server, method, args, reply).await
    }

    /// Forward an RPC to the local region's leader, or fail without one.
    pub async fn forward_leader<A, R>(
        &self,
        server: Option<&Peer>,
        method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<(), RpcError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let Some(server) = server else {
            return Err(RpcError::NoLeader);
        };
        self.pool_rpc(&self.config.region, server, method, args, reply)
            .await
    }

    /// Forward an RPC to a specific server.
    pub async fn forward_server<A, R>(
        &self,
        server: Option<&Peer>,
        method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<(), RpcError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let Some(server) = server else {
            return Err(RpcError::InvalidServer);
        };
        self.pool_rpc(&self.config.region, server, method, args, reply)
            .await
    }

    async fn pool_rpc<A, R>(
        &self,
        region: &str,
        server: &Peer,
        method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<(), RpcError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let payload = rmp_serde::to_vec_named(args).context(EncodeSnafu)?;
        let response = self
            .pool
            .rpc(region, server.rpc_addr, server.major_version, method, &payload)
            .await?;
        *reply = rmp_serde::from_slice(&response).context(DecodeSnafu)?;
        Ok(())
    }
}
