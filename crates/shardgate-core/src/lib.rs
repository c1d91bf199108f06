//! Shardgate Core - Shared library for the router and the gateway
//!
//! This crate provides the pieces that talk to the outside world:
//! configuration loading, backend primitives and node discovery.

pub mod backend;
pub mod config;
pub mod discovery;

pub use backend::{
    Backend, BackendError, Command, Connector, FailoverBackend, MemoryBackend, MemoryConnector,
    RedisConnector, Reply,
};
pub use config::{ConfigError, DiscoveryConfig, GatewayConfig, ShardConfig};
pub use discovery::{DiscoveryError, KubeNodeResolver, MembershipResolver, StaticResolver};
