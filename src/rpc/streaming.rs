//! Streaming RPC carrier.
//!
//! A streaming RPC starts as an ordinary framed exchange (the peer sends
//! `{method}`, the server answers `{error}`) and then stops being a
//! protocol: on an empty error the registered handler takes exclusive
//! ownership of the raw connection and frames whatever it wants. The
//! carrier never touches the connection again after dispatch; closing it
//! is the handler's job. A non-empty error in the acknowledgement means
//! the carrier closes the connection itself.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::constants::STREAMING_DIAL_TIMEOUT;
use crate::metrics::RpcMetrics;
use crate::rpc::codec::{self, StreamingRpcAck, StreamingRpcHeader};
use crate::rpc::context::{BoxedConn, ConnContext};
use crate::rpc::frame::FrameTag;
use crate::rpc::tls::TlsWrap;

/// A registered streaming handler. It owns the connection and must close
/// it when done.
pub type StreamingHandler =
    Arc<dyn Fn(Arc<ConnContext>, BoxedConn) -> BoxFuture<'static, ()> + Send + Sync>;

/// Method-name to handler mapping for streaming RPCs. Populated at
/// startup, read-only at request time.
#[derive(Default)]
pub struct StreamingRegistry {
    handlers: HashMap<String, StreamingHandler>,
}

impl StreamingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method`. Method names are unique.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: StreamingHandler,
    ) -> anyhow::Result<()> {
        let method = method.into();
        if self.handlers.contains_key(&method) {
            bail!("streaming rpc method {method:?} is already registered");
        }
        self.handlers.insert(method, handler);
        Ok(())
    }

    /// Look up the handler for a method.
    pub fn get(&self, method: &str) -> Option<&StreamingHandler> {
        self.handlers.get(method)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for StreamingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRegistry")
            .field("methods", &self.handlers.len())
            .finish()
    }
}

/// Serve one inbound streaming RPC: read the header, acknowledge, and hand
/// the connection to the handler.
pub(crate) async fn handle_streaming_conn(
    registry: &StreamingRegistry,
    metrics: &RpcMetrics,
    ctx: Arc<ConnContext>,
    mut conn: BoxedConn,
) {
    let header = match codec::read_message::<_, StreamingRpcHeader>(&mut conn).await {
        Ok(Some(header)) => header,
        Ok(None) => return,
        Err(err) => {
            if !codec::is_normal_close(&err) {
                error!(error = %err, remote_addr = %ctx.remote_addr, "streaming rpc error");
                metrics.incr_streaming_request_error();
            }
            return;
        }
    };

    let mut ack = StreamingRpcAck::default();
    let handler = registry.get(&header.method).cloned();
    if handler.is_none() {
        error!(method = %header.method, remote_addr = %ctx.remote_addr, "unknown streaming rpc");
        metrics.incr_streaming_request_error();
        ack.error = format!("unknown streaming rpc method: {:?}", header.method);
    }

    // The acknowledgement is always sent, error or not.
    if let Err(err) = codec::write_message(&mut conn, &ack).await {
        debug!(error = %err, "failed to send streaming rpc ack");
        return;
    }
    let Some(handler) = handler else {
        // Refused: dropping the connection here closes it; the handler
        // never sees it.
        return;
    };

    metrics.incr_streaming_request();
    handler(ctx, conn).await;
}

/// Dial a server and perform the streaming handshake for `method`. On
/// success the returned connection belongs to the caller, including
/// closing it.
pub async fn open_streaming(
    tls_wrap: Option<Arc<dyn TlsWrap>>,
    addr: std::net::SocketAddr,
    region: &str,
    method: &str,
) -> anyhow::Result<BoxedConn> {
    let stream = tokio::time::timeout(STREAMING_DIAL_TIMEOUT, TcpStream::connect(addr)).await??;
    stream.set_nodelay(true)?;
    open_streaming_on(tls_wrap, Box::new(stream), region, method).await
}

/// Perform the streaming handshake on a pre-established connection:
/// optionally upgrade to TLS, select the streaming sub-protocol, send the
/// header, and wait for the acknowledgement. On error the connection has
/// been closed; otherwise the remote handler owns its end.
pub async fn open_streaming_on(
    tls_wrap: Option<Arc<dyn TlsWrap>>,
    mut conn: BoxedConn,
    region: &str,
    method: &str,
) -> anyhow::Result<BoxedConn> {
    if let Some(wrap) = tls_wrap {
        conn.write_all(&[FrameTag::Tls.byte()]).await?;
        conn = wrap.wrap(region, conn).await?;
    }

    conn.write_all(&[FrameTag::Streaming.byte()]).await?;
    codec::write_message(
        &mut conn,
        &StreamingRpcHeader {
            method: method.to_string(),
        },
    )
    .await?;

    let ack = match codec::read_message::<_, StreamingRpcAck>(&mut conn).await? {
        Some(ack) => ack,
        None => bail!("connection closed before streaming rpc ack"),
    };
    if !ack.error.is_empty() {
        bail!(ack.error);
    }
    Ok(conn)
}
