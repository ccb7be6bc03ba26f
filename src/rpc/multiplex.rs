//! Stream-multiplexed sessions.
//!
//! A single physical connection tagged `MuxV1` or `MuxV2` becomes a yamux
//! server session whose sub-streams are served concurrently. Version 1
//! binds every sub-stream to request-reply RPC. Version 2 reads one more
//! tag byte per sub-stream and accepts only `Rpc` or `Streaming`; nested
//! multiplexing or TLS inside an established session is a protocol
//! violation that terminates the whole session.
//!
//! The accept loop doubles as the session's I/O driver, so per-sub-stream
//! reads happen in spawned tasks; a violating sub-stream cancels the
//! session token instead of returning from the loop directly.

use std::io;
use std::sync::Arc;

use futures::future::poll_fn;
use tokio::io::AsyncReadExt;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::rpc::context::{BoxedConn, ConnContext};
use crate::rpc::frame::FrameTag;
use crate::rpc::{RpcHandler, server, streaming};

/// Which multiplexing variant the outer frame selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MuxVersion {
    /// Sub-streams carry request-reply RPC only.
    V1,
    /// Sub-streams carry a one-byte tag choosing request-reply or
    /// streaming RPC.
    V2,
}

impl RpcHandler {
    /// Run a multiplexing session over `conn` until cancellation, session
    /// error, or EOF. On exit the node-connection mapping is removed and
    /// the physical connection closed.
    pub(crate) async fn handle_multiplex(
        self: &Arc<Self>,
        conn: BoxedConn,
        mut ctx: ConnContext,
        version: MuxVersion,
    ) {
        let session = self.shutdown.child_token();
        ctx.session = Some(session.clone());
        let ctx = Arc::new(ctx);

        let mut mux =
            yamux::Connection::new(conn.compat(), yamux::Config::default(), yamux::Mode::Server);
        loop {
            let inbound = tokio::select! {
                _ = session.cancelled() => break,
                inbound = poll_fn(|cx| mux.poll_next_inbound(cx)) => inbound,
            };
            match inbound {
                Some(Ok(stream)) => {
                    let sub: BoxedConn = Box::new(stream.compat());
                    let this = self.clone();
                    let ctx = ctx.clone();
                    let session = session.clone();
                    match version {
                        MuxVersion::V1 => {
                            tokio::spawn(async move {
                                server::serve_conn(
                                    &session,
                                    &this.dispatcher,
                                    &this.metrics,
                                    ctx,
                                    sub,
                                )
                                .await;
                            });
                        }
                        MuxVersion::V2 => {
                            tokio::spawn(async move {
                                this.serve_mux_v2_stream(session, ctx, sub).await;
                            });
                        }
                    }
                }
                Some(Err(err)) => {
                    error!(error = %err, remote_addr = %ctx.remote_addr, "multiplex accept failed");
                    break;
                }
                None => break,
            }
        }

        self.node_conns.remove_conn(&ctx);
        // Dropping the session closes the physical connection.
    }

    /// Serve one v2 sub-stream: read its tag byte and dispatch within the
    /// restricted alphabet.
    async fn serve_mux_v2_stream(
        self: Arc<Self>,
        session: CancellationToken,
        ctx: Arc<ConnContext>,
        mut sub: BoxedConn,
    ) {
        let mut buf = [0u8; 1];
        if let Err(err) = sub.read_exact(&mut buf).await {
            if err.kind() != io::ErrorKind::UnexpectedEof {
                error!(error = %err, "multiplex failed to read first stream byte");
            }
            session.cancel();
            return;
        }

        match FrameTag::from_byte(buf[0]) {
            Some(FrameTag::Rpc) => {
                server::serve_conn(&session, &self.dispatcher, &self.metrics, ctx, sub).await;
            }
            Some(FrameTag::Streaming) => {
                streaming::handle_streaming_conn(&self.streaming, &self.metrics, ctx, sub).await;
            }
            _ => {
                error!(byte = buf[0], "unrecognized multiplex stream byte");
                session.cancel();
            }
        }
    }
}
