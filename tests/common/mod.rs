//! Shared fixtures for the integration tests: mock consensus, a recording
//! connection pool, and wire-level client helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use larch::consensus::{Applied, RaftHandle};
use larch::rpc::{
    BoxedConn, ConnectionPool, RequestHeader, ResponseHeader, RpcHandler, RpcHandlerFn, RpcInfo,
    StreamingHandler, read_frame, read_message, write_frame, write_message,
};
use larch::{Peer, RpcError};

/// Scriptable consensus handle.
pub struct MockRaft {
    leader: AtomicBool,
    leader_addr: Mutex<Option<String>>,
    next_index: AtomicU64,
    /// Entries applied, as (message type byte, payload).
    pub applied: Mutex<Vec<(u8, Vec<u8>)>>,
    /// Connections handed off to the consensus transport.
    pub handoffs: AtomicUsize,
}

impl MockRaft {
    pub fn follower() -> Arc<Self> {
        Arc::new(Self {
            leader: AtomicBool::new(false),
            leader_addr: Mutex::new(None),
            next_index: AtomicU64::new(1),
            applied: Mutex::new(Vec::new()),
            handoffs: AtomicUsize::new(0),
        })
    }

    pub fn leader() -> Arc<Self> {
        let raft = Self::follower();
        raft.leader.store(true, Ordering::SeqCst);
        raft
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn set_leader_addr(&self, addr: Option<String>) {
        *self.leader_addr.lock() = addr;
    }
}

#[async_trait]
impl RaftHandle for MockRaft {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_addr(&self) -> Option<String> {
        self.leader_addr.lock().clone()
    }

    fn last_contact(&self) -> Option<tokio::time::Instant> {
        None
    }

    async fn apply(&self, entry: Bytes, _enqueue_limit: Duration) -> Result<Applied, RpcError> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.applied.lock().push((entry[0], entry[1..].to_vec()));
        Ok(Applied {
            response: b"applied".to_vec(),
            index,
        })
    }

    async fn handoff(&self, _shutdown: CancellationToken, conn: BoxedConn) -> anyhow::Result<()> {
        self.handoffs.fetch_add(1, Ordering::SeqCst);
        drop(conn);
        Ok(())
    }
}

/// One RPC the mock pool was asked to send.
#[derive(Debug, Clone)]
pub struct RecordedRpc {
    pub region: String,
    pub addr: SocketAddr,
    pub major_version: u8,
    pub method: String,
    pub args: Vec<u8>,
}

/// Connection pool that records calls and answers from a canned reply.
pub struct MockPool {
    pub calls: Mutex<Vec<RecordedRpc>>,
    reply: Vec<u8>,
}

impl MockPool {
    pub fn with_reply<T: Serialize>(reply: &T) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: rmp_serde::to_vec_named(reply).expect("encode canned reply"),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn rpc(
        &self,
        region: &str,
        addr: SocketAddr,
        major_version: u8,
        method: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        self.calls.lock().push(RecordedRpc {
            region: region.to_string(),
            addr,
            major_version,
            method: method.to_string(),
            args: args.to_vec(),
        });
        Ok(self.reply.clone())
    }
}

/// Request arguments used by the forwarding tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestArgs {
    pub region: String,
    pub read: bool,
    pub stale: bool,
    pub forwarded: bool,
    pub payload: String,
}

impl RpcInfo for TestArgs {
    fn request_region(&self) -> &str {
        &self.region
    }

    fn is_read(&self) -> bool {
        self.read
    }

    fn allow_stale_read(&self) -> bool {
        self.stale
    }

    fn set_forwarded(&mut self) {
        self.forwarded = true;
    }
}

/// Reply structure used by the forwarding tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReply {
    pub value: String,
}

pub fn peer(id: &str, region: &str, port: u16) -> Peer {
    Peer {
        id: id.to_string(),
        rpc_addr: ([127, 0, 0, 1], port).into(),
        raft_addr: format!("127.0.0.1:{}", port + 1000),
        region: region.to_string(),
        major_version: 1,
    }
}

/// Handler echoing the request body back.
pub fn echo_rpc() -> RpcHandlerFn {
    Arc::new(|_ctx, body| Box::pin(async move { Ok(body) }))
}

/// Streaming handler echoing frames until the peer closes.
pub fn echo_streaming() -> StreamingHandler {
    Arc::new(|_ctx, mut conn| {
        Box::pin(async move {
            while let Ok(Some(frame)) = read_frame(&mut conn).await {
                if write_frame(&mut conn, &frame).await.is_err() {
                    break;
                }
            }
        })
    })
}

/// Mutual-TLS fixture for upgrade tests: a throwaway CA issues the server
/// and client certificates, the acceptor verifies client certificates
/// against the CA, and the connector presents one.
pub struct TestTls {
    /// Server-side acceptor for the listener under test.
    pub acceptor: tokio_rustls::TlsAcceptor,
    /// Client-side connector trusting the CA.
    pub connector: tokio_rustls::TlsConnector,
    /// Name the server certificate carries; clients dial this.
    pub server_name: String,
    /// Common name of the client certificate.
    pub client_cn: String,
}

/// Build a [`TestTls`] fixture with fresh keys.
pub fn test_tls() -> TestTls {
    let ca_key = rcgen::KeyPair::generate().expect("generate ca key");
    let mut ca_params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("ca params");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.distinguished_name = rcgen::DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, "larch test ca");
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign ca");

    let server_name = "server.global.larch".to_string();
    let (server_cert, server_key) = issue_cert(&ca_cert, &ca_key, &server_name);
    let client_cn = "agent.global.larch".to_string();
    let (client_cert, client_key) = issue_cert(&ca_cert, &ca_key, &client_cn);

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_cert.der().clone()).expect("add ca root");

    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots.clone()))
        .build()
        .expect("build client verifier");
    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![server_cert], server_key)
        .expect("server config");

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(vec![client_cert], client_key)
        .expect("client config");

    TestTls {
        acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        connector: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        server_name,
        client_cn,
    }
}

/// Issue a certificate from the test CA with `name` as both the common
/// name and the DNS subject alternative name.
fn issue_cert(
    ca_cert: &rcgen::Certificate,
    ca_key: &rcgen::KeyPair,
    name: &str,
) -> (
    rustls::pki_types::CertificateDer<'static>,
    rustls::pki_types::PrivateKeyDer<'static>,
) {
    let mut params = rcgen::CertificateParams::new(vec![name.to_string()]).expect("cert params");
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, name);
    let key = rcgen::KeyPair::generate().expect("generate key");
    let cert = params.signed_by(&key, ca_cert, ca_key).expect("sign cert");
    (
        cert.der().clone(),
        rustls::pki_types::PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
    )
}

/// In-memory indexed store for blocking-query tests.
pub struct MemStore {
    index: AtomicU64,
    abandon: tokio::sync::watch::Sender<()>,
    /// Fires whenever the index advances.
    pub change: tokio::sync::watch::Sender<()>,
}

impl MemStore {
    pub fn new(index: u64) -> Self {
        Self {
            index: AtomicU64::new(index),
            abandon: tokio::sync::watch::channel(()).0,
            change: tokio::sync::watch::channel(()).0,
        }
    }

    pub fn advance(&self, index: u64) {
        self.index.store(index, Ordering::SeqCst);
        let _ = self.change.send(());
    }
}

impl larch::WatchableStore for MemStore {
    type Snapshot = u64;

    fn snapshot(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    fn abandon_watch(&self) -> tokio::sync::watch::Receiver<()> {
        self.abandon.subscribe()
    }
}

/// Store source whose store can be wholesale replaced, as a snapshot
/// restore would.
pub struct MemSource {
    store: Mutex<Arc<MemStore>>,
}

impl MemSource {
    pub fn new(index: u64) -> Self {
        Self {
            store: Mutex::new(Arc::new(MemStore::new(index))),
        }
    }

    pub fn current(&self) -> Arc<MemStore> {
        self.store.lock().clone()
    }

    pub fn restore(&self, index: u64) {
        let replacement = Arc::new(MemStore::new(index));
        let old = std::mem::replace(&mut *self.store.lock(), replacement);
        let _ = old.abandon.send(());
    }
}

impl larch::StateSource for MemSource {
    type Store = MemStore;

    fn state(&self) -> Arc<MemStore> {
        self.current()
    }
}

/// Bind a loopback listener, spawn the accept loop, and return its address.
pub async fn spawn_listener(handler: Arc<RpcHandler>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(handler.listen(listener));
    addr
}

/// Send one request-reply RPC over an established byte stream and read the
/// answer. Returns the response header and, when there was no error, the
/// body frame.
pub async fn rpc_exchange<C>(
    conn: &mut C,
    seq: u64,
    method: &str,
    body: &[u8],
) -> (ResponseHeader, Option<Vec<u8>>)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    write_message(
        conn,
        &RequestHeader {
            seq,
            method: method.to_string(),
        },
    )
    .await
    .expect("write request header");
    write_frame(conn, body).await.expect("write request body");

    let header: ResponseHeader = read_message(conn)
        .await
        .expect("read response header")
        .expect("response header present");
    let body = if header.error.is_none() {
        Some(
            read_frame(conn)
                .await
                .expect("read response body")
                .expect("response body present")
                .to_vec(),
        )
    } else {
        None
    };
    (header, body)
}

/// Decode a canned pool reply the way the forwarder would.
pub fn decode_reply<T: DeserializeOwned>(bytes: &[u8]) -> T {
    rmp_serde::from_slice(bytes).expect("decode reply")
}
