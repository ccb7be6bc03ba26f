//! Request-reply RPC dispatch.
//!
//! A connection carrying the RPC sub-protocol is served by a single task:
//! requests are decoded, dispatched, and answered strictly in the order
//! they arrive. Handlers are looked up by method name in an
//! [`RpcDispatcher`] populated at startup and read-only afterwards; each
//! handler sees the encoded argument bytes plus the connection context, so
//! per-connection identity (TLS chains, node id) reaches it without any
//! shared mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::RpcMetrics;
use crate::rpc::codec::{self, RequestHeader, ResponseHeader};
use crate::rpc::context::{BoxedConn, ConnContext};

/// A registered request-reply handler: encoded arguments in, encoded
/// response out. Typed entry points are generated adapters over this shape.
pub type RpcHandlerFn =
    Arc<dyn Fn(Arc<ConnContext>, Bytes) -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>;

/// Method-name to handler mapping for request-reply RPCs.
#[derive(Default)]
pub struct RpcDispatcher {
    handlers: HashMap<String, RpcHandlerFn>,
}

impl RpcDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method`. Method names are unique; a second
    /// registration for the same name is a startup bug.
    pub fn register(&mut self, method: impl Into<String>, handler: RpcHandlerFn) -> anyhow::Result<()> {
        let method = method.into();
        if self.handlers.contains_key(&method) {
            bail!("rpc method {method:?} is already registered");
        }
        self.handlers.insert(method, handler);
        Ok(())
    }

    /// Look up the handler for a method.
    pub fn get(&self, method: &str) -> Option<&RpcHandlerFn> {
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

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("methods", &self.handlers.len())
            .finish()
    }
}

/// Serve request-reply RPCs on `conn` until the peer closes, the server
/// shuts down, or a transport error tears the connection.
pub(crate) async fn serve_conn(
    shutdown: &CancellationToken,
    dispatcher: &RpcDispatcher,
    metrics: &RpcMetrics,
    ctx: Arc<ConnContext>,
    mut conn: BoxedConn,
) {
    loop {
        if shutdown.is_cancelled() {
            info!("closing server rpc connection");
            return;
        }

        let header = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("closing server rpc connection");
                return;
            }
            header = codec::read_message::<_, RequestHeader>(&mut conn) => header,
        };
        let header = match header {
            Ok(Some(header)) => header,
            Ok(None) => return,
            Err(err) => {
                if !codec::is_normal_close(&err) {
                    error!(error = %err, remote_addr = %ctx.remote_addr, "rpc request error");
                    metrics.incr_request_error();
                }
                return;
            }
        };
        let body = match codec::read_frame(&mut conn).await {
            Ok(Some(body)) => body,
            Ok(None) => return,
            Err(err) => {
                if !codec::is_normal_close(&err) {
                    error!(error = %err, remote_addr = %ctx.remote_addr, "rpc request error");
                    metrics.incr_request_error();
                }
                return;
            }
        };

        let result = match dispatcher.get(&header.method) {
            Some(handler) => handler(ctx.clone(), body).await,
            None => Err(anyhow::anyhow!("unknown rpc method: {:?}", header.method)),
        };

        let write_result = match result {
            Ok(response) => {
                let response_header = ResponseHeader {
                    seq: header.seq,
                    error: None,
                };
                match codec::write_message(&mut conn, &response_header).await {
                    Ok(()) => codec::write_frame(&mut conn, &response).await,
                    Err(err) => Err(err),
                }
            }
            Err(err) => {
                // An error response carries the error string in lieu of a
                // body frame.
                let response_header = ResponseHeader {
                    seq: header.seq,
                    error: Some(err.to_string()),
                };
                codec::write_message(&mut conn, &response_header).await
            }
        };
        if let Err(err) = write_result {
            if !codec::is_normal_close(&err) {
                error!(error = %err, remote_addr = %ctx.remote_addr, "rpc response error");
                metrics.incr_request_error();
            }
            return;
        }
        metrics.incr_request();
    }
}
