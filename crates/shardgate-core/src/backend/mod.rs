//! Backend primitives
//!
//! Every dispatcher call is lowered to exactly one [`Command`] per backend
//! round trip. Implementations decide how a command reaches a store:
//!
//! - `FailoverBackend`: sentinel-managed primary/standby Redis group
//! - `MemoryBackend`: in-process store for tests and local runs

mod failover;
mod memory;

pub use failover::{FailoverBackend, RedisConnector};
pub use memory::{MemoryBackend, MemoryConnector};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ShardConfig;

/// Backend error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Error reported by the backend itself, text kept verbatim
    #[error("{0}")]
    Command(String),

    /// Could not establish or verify a connection
    #[error("connect failed: {0}")]
    Connect(String),

    /// The call did not finish within the configured bound
    #[error("command timed out after {0}ms")]
    Timeout(u64),

    /// The backend answered with a shape the command does not produce
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },
}

/// One backend primitive
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    DbSize,

    // Generic key
    Del { key: String },
    Exists { key: String },
    Expire { key: String, seconds: u64 },

    // String
    Get { key: String },
    /// `SET key value [EX seconds]`, value and TTL applied atomically
    Set { key: String, value: String, expire: Option<u64> },

    // Hash
    HSet { key: String, field: String, value: String },
    HMSet { key: String, pairs: Vec<(String, String)> },
    HGet { key: String, field: String },
    HMGet { key: String, fields: Vec<String> },
    HGetAll { key: String },
    HDel { key: String, fields: Vec<String> },

    // Set
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    SMove { source: String, destination: String, member: String },
    SPop { key: String },
    SRandMember { key: String },
    SCard { key: String },
    SIsMember { key: String, member: String },
    SMembers { key: String },

    // Sorted set
    ZAdd { key: String, score: f64, member: String },
    ZRank { key: String, member: String },
    ZRevRank { key: String, member: String },
    ZRange { key: String, start: i64, stop: i64 },

    // List
    LPush { key: String, values: Vec<String> },
}

impl Command {
    /// Wire name of the primitive
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::DbSize => "DBSIZE",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Expire { .. } => "EXPIRE",
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::HSet { .. } => "HSET",
            Command::HMSet { .. } => "HMSET",
            Command::HGet { .. } => "HGET",
            Command::HMGet { .. } => "HMGET",
            Command::HGetAll { .. } => "HGETALL",
            Command::HDel { .. } => "HDEL",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SMove { .. } => "SMOVE",
            Command::SPop { .. } => "SPOP",
            Command::SRandMember { .. } => "SRANDMEMBER",
            Command::SCard { .. } => "SCARD",
            Command::SIsMember { .. } => "SISMEMBER",
            Command::SMembers { .. } => "SMEMBERS",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRank { .. } => "ZRANK",
            Command::ZRevRank { .. } => "ZREVRANK",
            Command::ZRange { .. } => "ZRANGE",
            Command::LPush { .. } => "LPUSH",
        }
    }
}

/// Backend reply, already narrowed to what the issuing command can return
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Nil,
    Int(i64),
    Bool(bool),
    Str(String),
    List(Vec<String>),
    /// Per-position lookups where individual slots may be missing (HMGET)
    Sparse(Vec<Option<String>>),
    Map(BTreeMap<String, String>),
}

impl Reply {
    /// Interpret an integer reply, rejecting anything else
    pub fn into_int(self, command: &'static str) -> Result<i64, BackendError> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interpret a boolean reply; integer 0/1 is accepted as well
    pub fn into_bool(self, command: &'static str) -> Result<bool, BackendError> {
        match self {
            Reply::Bool(b) => Ok(b),
            Reply::Int(n) => Ok(n != 0),
            other => Err(unexpected(command, &other)),
        }
    }
}

fn unexpected(command: &'static str, reply: &Reply) -> BackendError {
    BackendError::UnexpectedReply {
        command,
        reply: format!("{:?}", reply),
    }
}

/// A live handle to one shard.
///
/// Implementations must be safe for unlimited concurrent callers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one primitive
    async fn execute(&self, command: Command) -> Result<Reply, BackendError>;

    /// Human-readable description for logging
    fn describe(&self) -> String;

    /// Liveness check
    async fn ping(&self) -> Result<(), BackendError> {
        self.execute(Command::Ping).await.map(|_| ())
    }
}

/// Builds a backend for one shard out of its discovered hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `hosts` (already `host:port`) and verify liveness
    async fn connect(
        &self,
        shard: &str,
        config: &ShardConfig,
        hosts: &[String],
    ) -> Result<Arc<dyn Backend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        let cmd = Command::Set {
            key: "k".into(),
            value: "v".into(),
            expire: Some(10),
        };
        assert_eq!(cmd.name(), "SET");
        assert_eq!(Command::HGetAll { key: "h".into() }.name(), "HGETALL");
    }

    #[test]
    fn test_reply_narrowing() {
        assert_eq!(Reply::Int(3).into_int("SCARD").unwrap(), 3);
        assert!(Reply::Int(1).into_bool("EXISTS").unwrap());
        assert!(!Reply::Bool(false).into_bool("SISMEMBER").unwrap());
        assert!(matches!(
            Reply::Nil.into_int("SCARD"),
            Err(BackendError::UnexpectedReply { command: "SCARD", .. })
        ));
    }

    #[test]
    fn test_error_messages_are_verbatim() {
        let err = BackendError::Command("WRONGTYPE Operation against a key".into());
        assert_eq!(err.to_string(), "WRONGTYPE Operation against a key");
        assert_eq!(
            BackendError::Timeout(250).to_string(),
            "command timed out after 250ms"
        );
    }
}
