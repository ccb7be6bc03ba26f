//! Fixed bounds for the RPC core.
//!
//! Constants are fixed and immutable, enforced at compile time. Each bound
//! exists to keep a resource or a wait finite; none of them are tunable at
//! runtime except through [`crate::config::RpcConfig`], which defaults to
//! the values here.

use std::time::Duration;

/// Upper bound on the wait of a blocking query.
pub const MAX_QUERY_TIME: Duration = Duration::from_secs(300);

/// Wait applied to a blocking query that did not specify one.
pub const DEFAULT_QUERY_TIME: Duration = Duration::from_secs(300);

/// Consensus entries larger than this are logged as suspicious. Anything
/// over 1 MiB is probably an abusive payload, but it is still applied.
pub const RAFT_WARN_SIZE: usize = 1024 * 1024;

/// Cap on how long a consensus apply waits to enqueue. Reaching this limit
/// means something is wrong with the consensus pipeline, but it keeps the
/// requesting task from blocking forever.
pub const ENQUEUE_LIMIT: Duration = Duration::from_secs(30);

/// Divisor applied to a base duration to derive its random stagger range.
pub const JITTER_FRACTION: u32 = 16;

/// Default bound on waiting for a leader before failing a forwarded RPC.
pub const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum size of a single length-prefixed wire frame.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Dial timeout for outbound streaming RPC connections.
pub const STREAMING_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
