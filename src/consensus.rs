//! Consensus submission.
//!
//! The consensus engine itself lives behind [`RaftHandle`]; this module
//! owns the wire shape of a log entry (a single-byte message-type tag
//! followed by the MessagePack payload) and the apply helper that encodes,
//! submits with a bounded enqueue wait, and hands back the state-machine
//! result together with the replicated index.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use snafu::ResultExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{EncodeSnafu, RpcError};
use crate::rpc::BoxedConn;

/// Single-byte tag identifying the kind of a consensus log entry.
///
/// The tag values are part of the replicated log format; the embedding
/// server defines them and must never renumber existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u8);

/// Outcome of a successfully applied consensus entry.
#[derive(Debug, Clone)]
pub struct Applied {
    /// Opaque state-machine response for the entry.
    pub response: Vec<u8>,
    /// Index the entry was replicated at.
    pub index: u64,
}

/// Handle onto the local consensus engine.
#[async_trait]
pub trait RaftHandle: Send + Sync {
    /// Whether this server currently leads its region.
    fn is_leader(&self) -> bool;

    /// Transport address of the current leader, if one is known. The
    /// address must match [`crate::cluster::Peer::raft_addr`] for lookup.
    fn leader_addr(&self) -> Option<String>;

    /// When this server last heard from the leader. `None` before any
    /// contact.
    fn last_contact(&self) -> Option<Instant>;

    /// Submit an encoded entry, waiting at most `enqueue_limit` to enqueue
    /// it, and resolve once the entry is applied to the state machine.
    async fn apply(&self, entry: Bytes, enqueue_limit: Duration) -> Result<Applied, RpcError>;

    /// Take ownership of an inbound connection carrying consensus traffic.
    async fn handoff(&self, shutdown: CancellationToken, conn: BoxedConn) -> anyhow::Result<()>;
}

/// Encode a typed message into consensus log-entry form: one tag byte, then
/// the MessagePack payload.
pub fn encode_entry<T: Serialize>(t: MessageType, msg: &T) -> Result<Bytes, RpcError> {
    let mut buf = vec![t.0];
    rmp_serde::encode::write_named(&mut buf, msg).context(EncodeSnafu)?;
    Ok(buf.into())
}

/// Encode `msg`, submit it to consensus, and return the state-machine
/// response along with the replicated index.
pub async fn raft_apply<T: Serialize>(
    raft: &dyn RaftHandle,
    t: MessageType,
    msg: &T,
    warn_size: usize,
    enqueue_limit: Duration,
) -> Result<(Vec<u8>, u64), RpcError> {
    let entry = encode_entry(t, msg)?;
    if entry.len() > warn_size {
        warn!(
            message_type = t.0,
            bytes = entry.len(),
            "attempting to apply large consensus entry"
        );
    }
    let applied = raft.apply(entry, enqueue_limit).await?;
    Ok((applied.response, applied.index))
}
