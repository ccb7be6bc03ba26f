//! Accept loop and frame demultiplexer.
//!
//! Exactly one byte is read off every accepted connection before any
//! sub-protocol touches it. The TLS tag re-enters the demultiplexer on the
//! wrapped connection; the loop here bounds that to a single upgrade, since
//! a second TLS tag on an already-upgraded connection is rejected.

use std::io;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::rpc::context::{BoxedConn, ConnContext};
use crate::rpc::frame::FrameTag;
use crate::rpc::multiplex::MuxVersion;
use crate::rpc::tls::cert_identity;
use crate::rpc::{RpcHandler, server, streaming};

impl RpcHandler {
    /// Accept inbound RPC connections until shutdown. Each connection runs
    /// in its own task.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("closing server rpc listener");
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote_addr)) => {
                    self.metrics.incr_accept_conn();
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_conn(Box::new(stream), ConnContext::new(remote_addr))
                            .await;
                    });
                }
                Err(err) => {
                    if self.shutdown.is_cancelled() {
                        return;
                    }
                    error!(error = %err, "failed to accept rpc connection");
                }
            }
        }
    }

    /// Route one connection by its frame byte. Consumes the connection;
    /// every exit path closes it by dropping unless a handler took
    /// ownership.
    pub(crate) async fn handle_conn(self: Arc<Self>, mut conn: BoxedConn, mut ctx: ConnContext) {
        loop {
            let mut buf = [0u8; 1];
            if let Err(err) = conn.read_exact(&mut buf).await {
                // EOF on the first byte is a peer probing the port.
                if err.kind() != io::ErrorKind::UnexpectedEof {
                    error!(error = %err, remote_addr = %ctx.remote_addr, "failed to read first rpc byte");
                }
                return;
            }
            let tag = FrameTag::from_byte(buf[0]);

            if self.config.require_tls
                && !ctx.tls
                && tag != Some(FrameTag::Tls)
                && !self.config.tls_upgrade_mode
            {
                warn!(
                    remote_addr = %ctx.remote_addr,
                    "rejecting non-tls connection while tls is required"
                );
                return;
            }

            match tag {
                Some(FrameTag::Rpc) => {
                    let ctx = Arc::new(ctx);
                    server::serve_conn(
                        &self.shutdown,
                        &self.dispatcher,
                        &self.metrics,
                        ctx.clone(),
                        conn,
                    )
                    .await;
                    self.node_conns.remove_conn(&ctx);
                    return;
                }
                Some(FrameTag::Raft) => {
                    self.metrics.incr_raft_handoff();
                    if let Err(err) = self.raft.handoff(self.shutdown.clone(), conn).await {
                        error!(error = %err, "consensus transport handoff failed");
                    }
                    return;
                }
                Some(FrameTag::MuxV1) => {
                    self.handle_multiplex(conn, ctx, MuxVersion::V1).await;
                    return;
                }
                Some(FrameTag::Tls) => {
                    if ctx.tls {
                        warn!(
                            remote_addr = %ctx.remote_addr,
                            "tls frame on an already-upgraded connection"
                        );
                        return;
                    }
                    let Some(acceptor) = self.tls_acceptor() else {
                        warn!(
                            remote_addr = %ctx.remote_addr,
                            "tls connection attempted, server not configured for tls"
                        );
                        return;
                    };
                    let tls_stream = match acceptor.accept(conn).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            warn!(
                                error = %err,
                                remote_addr = %ctx.remote_addr,
                                "tls handshake failed"
                            );
                            return;
                        }
                    };
                    let chains: Vec<_> = tls_stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .map(|chain| vec![chain.to_vec()])
                        .unwrap_or_default();
                    ctx.identity = chains
                        .first()
                        .and_then(|chain| chain.first())
                        .and_then(cert_identity);
                    ctx.verified_chains = chains;
                    ctx.tls = true;
                    conn = Box::new(tls_stream);
                    // Re-read the frame byte on the wrapped connection.
                }
                Some(FrameTag::Streaming) => {
                    streaming::handle_streaming_conn(
                        &self.streaming,
                        &self.metrics,
                        Arc::new(ctx),
                        conn,
                    )
                    .await;
                    return;
                }
                Some(FrameTag::MuxV2) => {
                    self.handle_multiplex(conn, ctx, MuxVersion::V2).await;
                    return;
                }
                None => {
                    error!(byte = buf[0], remote_addr = %ctx.remote_addr, "unrecognized rpc byte");
                    return;
                }
            }
        }
    }
}
