//! Per-connection context.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Byte stream the demultiplexer can route: anything readable, writable,
/// and movable across tasks. TLS upgrades and multiplexed sub-streams all
/// erase to this.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

impl std::fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Conn")
    }
}

/// Owned, type-erased connection.
pub type BoxedConn = Box<dyn Conn>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata about one physical connection, carried through TLS upgrade and
/// multiplexing so handlers can see who they are talking to.
#[derive(Debug)]
pub struct ConnContext {
    conn_id: u64,
    /// Remote endpoint of the physical connection.
    pub remote_addr: SocketAddr,
    /// Whether the connection was upgraded to TLS.
    pub tls: bool,
    /// Certificate chains the peer presented, verified during the
    /// handshake. Empty when the peer presented none.
    pub verified_chains: Vec<Vec<CertificateDer<'static>>>,
    /// Caller identity extracted from the leaf certificate, if any.
    pub identity: Option<String>,
    /// Cancellation handle of the multiplexing session, when the
    /// connection carries one.
    pub session: Option<CancellationToken>,
    node_id: RwLock<Option<String>>,
}

impl ConnContext {
    /// Create the context for a freshly accepted connection.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            tls: false,
            verified_chains: Vec::new(),
            identity: None,
            session: None,
            node_id: RwLock::new(None),
        }
    }

    /// Process-unique identifier of this connection.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Node identity that registered this connection, if any.
    pub fn node_id(&self) -> Option<String> {
        self.node_id.read().clone()
    }

    /// Record the node identity that owns this connection.
    pub fn set_node_id(&self, node_id: impl Into<String>) {
        *self.node_id.write() = Some(node_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_unique() {
        let a = ConnContext::new(([127, 0, 0, 1], 1).into());
        let b = ConnContext::new(([127, 0, 0, 1], 2).into());
        assert_ne!(a.conn_id(), b.conn_id());
    }

    #[test]
    fn node_id_round_trip() {
        let ctx = ConnContext::new(([127, 0, 0, 1], 1).into());
        assert!(ctx.node_id().is_none());
        ctx.set_node_id("node-9");
        assert_eq!(ctx.node_id().as_deref(), Some("node-9"));
    }
}
