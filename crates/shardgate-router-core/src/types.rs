//! Common types for the router module

use serde::{Deserialize, Serialize};

/// Shard identifier, the key of the `[shards]` table in the configuration
pub type ShardName = String;

/// One virtual node on the hash ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingPoint {
    pub hash: u64,
    pub shard: ShardName,
}
