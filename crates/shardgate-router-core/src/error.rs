//! Error types for the router module

use shardgate_core::{BackendError, DiscoveryError};
use thiserror::Error;

/// Router error types
#[derive(Debug, Error)]
pub enum RouterError {
    /// No shard is registered on the ring
    #[error("no shard available for routing")]
    EmptyRing,

    /// The ring named a shard that has no connection
    #[error("shard '{0}' is on the ring but not connected")]
    ShardNotConnected(String),

    /// The shard already holds a connection; remove it before re-adding
    #[error("shard '{0}' is already admitted")]
    ShardAlreadyAdmitted(String),

    /// Node discovery failed for a shard
    #[error("discovery failed for shard '{shard}': {source}")]
    Discovery {
        shard: String,
        #[source]
        source: DiscoveryError,
    },

    /// Connect or liveness check failed for a shard
    #[error("backend link failed for shard '{shard}': {source}")]
    Backend {
        shard: String,
        #[source]
        source: BackendError,
    },

    /// Every configured shard failed admission
    #[error("no shard could be admitted")]
    NoShardsAdmitted,
}
