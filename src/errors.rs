//! Error types surfaced by the RPC core.
//!
//! Transport-level failures (torn connections, framing violations) are
//! logged and close the connection without surfacing here; there is no
//! caller left for a torn session. `RpcError` covers the failures a handler
//! or forwarder returns to its caller.

use snafu::Snafu;

/// Errors returned by forwarding, blocking queries, and consensus
/// submission.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RpcError {
    /// The request named no target region.
    #[snafu(display("missing target region for rpc"))]
    MissingRegion,

    /// No known servers for the target region.
    #[snafu(display("no path found to region \"{region}\""))]
    NoRegionPath {
        /// The region with no known servers.
        region: String,
    },

    /// Leader wait exhausted without a leader being elected.
    #[snafu(display("no cluster leader"))]
    NoLeader,

    /// A server-directed RPC was given no server.
    #[snafu(display("must be given a valid server address"))]
    InvalidServer,

    /// Consensus payload encoding failed.
    #[snafu(display("failed to encode consensus entry: {source}"))]
    Encode {
        /// Underlying serialization failure.
        source: rmp_serde::encode::Error,
    },

    /// A forwarded reply could not be decoded.
    #[snafu(display("failed to decode rpc reply: {source}"))]
    Decode {
        /// Underlying deserialization failure.
        source: rmp_serde::decode::Error,
    },

    /// The consensus apply future resolved to an error.
    #[snafu(display("{message}"))]
    Apply {
        /// Error reported by the consensus engine, verbatim.
        message: String,
    },

    /// A remote server answered the forwarded RPC with an error.
    #[snafu(display("remote rpc error: {message}"))]
    Remote {
        /// Error string carried in the remote response.
        message: String,
    },
}
