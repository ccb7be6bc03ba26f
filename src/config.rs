//! Configuration consumed by the RPC core.
//!
//! `RpcConfig` carries the knobs the demultiplexer, forwarder, and
//! blocking-query engine read. It deserializes from the node's TOML
//! configuration and validates fail-fast before the listener starts.

use std::time::Duration;

use serde::Deserialize;
use snafu::{Snafu, ensure};

use crate::constants;

/// Configuration for the RPC core of one server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    /// Region this server belongs to.
    pub region: String,

    /// Require inbound RPC connections to upgrade to TLS.
    pub require_tls: bool,

    /// Migration relaxation: accept a non-TLS frame on the outer connection
    /// even while `require_tls` is set. Does not disable any later check.
    pub tls_upgrade_mode: bool,

    /// Bound on waiting for leader election before failing a forwarded RPC.
    pub hold_timeout: Duration,

    /// Upper clamp on a blocking query's requested wait.
    pub max_query_time: Duration,

    /// Wait applied when a blocking query requests none.
    pub default_query_time: Duration,

    /// Divisor deriving the random stagger range from a base duration.
    pub jitter_fraction: u32,

    /// Consensus entries above this size log a warning.
    pub raft_warn_size: usize,

    /// Bound on waiting to enqueue a consensus entry.
    pub enqueue_limit: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            region: "global".to_string(),
            require_tls: false,
            tls_upgrade_mode: false,
            hold_timeout: constants::DEFAULT_HOLD_TIMEOUT,
            max_query_time: constants::MAX_QUERY_TIME,
            default_query_time: constants::DEFAULT_QUERY_TIME,
            jitter_fraction: constants::JITTER_FRACTION,
            raft_warn_size: constants::RAFT_WARN_SIZE,
            enqueue_limit: constants::ENQUEUE_LIMIT,
        }
    }
}

/// Validation failures for [`RpcConfig`].
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The region name was empty.
    #[snafu(display("region must not be empty"))]
    EmptyRegion,

    /// The jitter fraction was zero, which would divide by zero when
    /// deriving stagger ranges.
    #[snafu(display("jitter_fraction must be positive"))]
    ZeroJitterFraction,

    /// The default query time exceeded the maximum query time.
    #[snafu(display(
        "default_query_time ({default:?}) must not exceed max_query_time ({max:?})"
    ))]
    QueryTimeOrder {
        /// Configured default wait.
        default: Duration,
        /// Configured maximum wait.
        max: Duration,
    },
}

impl RpcConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.region.is_empty(), EmptyRegionSnafu);
        ensure!(self.jitter_fraction > 0, ZeroJitterFractionSnafu);
        ensure!(
            self.default_query_time <= self.max_query_time,
            QueryTimeOrderSnafu {
                default: self.default_query_time,
                max: self.max_query_time,
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = RpcConfig::default();
        assert_eq!(config.region, "global");
        assert_eq!(config.jitter_fraction, 16);
        assert!(!config.require_tls);
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn empty_region_rejected() {
        let config = RpcConfig {
            region: String::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyRegion)));
    }

    #[test]
    fn zero_jitter_fraction_rejected() {
        let config = RpcConfig {
            jitter_fraction: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroJitterFraction)
        ));
    }

    #[test]
    fn inverted_query_times_rejected() {
        let config = RpcConfig {
            max_query_time: Duration::from_secs(1),
            default_query_time: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QueryTimeOrder { .. })
        ));
    }
}
