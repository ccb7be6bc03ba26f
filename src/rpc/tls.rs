//! TLS upgrade support.
//!
//! Inbound: the demultiplexer wraps the connection with the server's
//! rotatable [`tokio_rustls::TlsAcceptor`] and records the verified chains
//! on the connection context. Outbound: a [`TlsWrap`] turns a plain
//! connection into a TLS client connection for the target region; it hangs
//! off the handler behind its own lock because certificate reloads rotate
//! it at runtime.

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsConnector;

use crate::rpc::context::BoxedConn;

/// Client-side TLS wrapping for outbound connections.
#[async_trait]
pub trait TlsWrap: Send + Sync {
    /// Wrap `conn` in a TLS client session addressed to a server of
    /// `region`. On error the connection is consumed and dropped.
    async fn wrap(&self, region: &str, conn: BoxedConn) -> anyhow::Result<BoxedConn>;
}

/// [`TlsWrap`] backed by rustls, expecting server certificates named
/// `server.<region>.<domain>`.
pub struct RegionTlsWrap {
    connector: TlsConnector,
    domain: String,
}

impl RegionTlsWrap {
    /// Create a wrapper from a client connector and the cluster's
    /// certificate domain suffix.
    pub fn new(connector: TlsConnector, domain: impl Into<String>) -> Self {
        Self {
            connector,
            domain: domain.into(),
        }
    }

    /// The server name dialed for a region.
    pub fn server_name(&self, region: &str) -> String {
        format!("server.{region}.{}", self.domain)
    }
}

impl std::fmt::Debug for RegionTlsWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionTlsWrap")
            .field("domain", &self.domain)
            .finish()
    }
}

#[async_trait]
impl TlsWrap for RegionTlsWrap {
    async fn wrap(&self, region: &str, conn: BoxedConn) -> anyhow::Result<BoxedConn> {
        let server_name = ServerName::try_from(self.server_name(region))?;
        let tls_conn = self.connector.connect(server_name, conn).await?;
        Ok(Box::new(tls_conn))
    }
}

/// Extract the subject common name from a DER-encoded certificate.
///
/// This is an identity tag for logging and connection bookkeeping, not an
/// authorization decision: it scans for the id-at-commonName attribute and
/// takes the directory string that follows it.
pub fn cert_identity(cert: &CertificateDer<'_>) -> Option<String> {
    const COMMON_NAME_OID: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];
    let der = cert.as_ref();
    let mut offset = 0;
    while offset + COMMON_NAME_OID.len() + 2 <= der.len() {
        if der[offset..offset + COMMON_NAME_OID.len()] != COMMON_NAME_OID {
            offset += 1;
            continue;
        }
        let value = &der[offset + COMMON_NAME_OID.len()..];
        // UTF8String, PrintableString, or IA5String with a short-form
        // length.
        if value.len() < 2 || !matches!(value[0], 0x0c | 0x13 | 0x16) {
            offset += 1;
            continue;
        }
        let len = value[1] as usize;
        if value[1] >= 0x80 || value.len() < 2 + len {
            offset += 1;
            continue;
        }
        if let Ok(name) = std::str::from_utf8(&value[2..2 + len]) {
            return Some(name.to_string());
        }
        offset += 1;
    }
    None
}
