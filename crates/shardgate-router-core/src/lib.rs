//! Shardgate Router Core - Key to shard routing
//!
//! Maps every key to one backend shard and hands out that shard's backend.
//!
//! # Architecture
//!
//! ```text
//! key
//!  │
//!  ▼
//! ┌─────────────────────────┐
//! │        HashRing         │  Consistent hashing over admitted shards
//! │    (Which shard?)       │
//! └───────────┬─────────────┘
//!             │ shard name
//!             ▼
//! ┌─────────────────────────┐
//! │    ShardConnections     │  One failover backend per shard
//! │  (Which connection?)    │
//! └─────────────────────────┘
//! ```
//!
//! Shards enter the ring through admission: discover hosts, connect, ping,
//! then register. A shard that fails any step never appears on the ring.
//!
//! # Example
//!
//! ```rust,ignore
//! use shardgate_router_core::ShardConnections;
//!
//! let connections = ShardConnections::new(config.virtual_nodes);
//! connections.admit_all(&config, &resolver, &connector).await?;
//!
//! let (shard, backend) = connections.route("user:42")?;
//! ```

mod connections;
mod error;
mod ring;
mod types;

pub use connections::{AdmissionReport, ShardConnections};
pub use error::RouterError;
pub use ring::HashRing;
pub use types::{RingPoint, ShardName};
