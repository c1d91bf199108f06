//! Sentinel-managed Redis backend
//!
//! The sentinels resolve the current primary of a failover group. The
//! resulting multiplexed connection is cached and shared by all callers;
//! after a connection-level fault the cache is dropped so the next call asks
//! the sentinels again and lands on whichever node was promoted.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{RedisConnectionInfo, RedisError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Backend, BackendError, Command, Connector, Reply};
use crate::config::ShardConfig;

impl From<RedisError> for BackendError {
    fn from(err: RedisError) -> Self {
        BackendError::Command(err.to_string())
    }
}

/// Primary/standby connection for one shard
pub struct FailoverBackend {
    group: String,
    sentinels: Vec<String>,
    client: Mutex<SentinelClient>,
    /// Connection to the current primary, `None` until first use or after a fault
    cached: RwLock<Option<MultiplexedConnection>>,
    command_timeout: Duration,
}

impl FailoverBackend {
    /// Build a backend over `sentinels` (`host:port` each) without connecting yet
    pub fn new(
        group: &str,
        sentinels: &[String],
        database: i64,
        password: Option<&str>,
        command_timeout: Duration,
    ) -> Result<Self, BackendError> {
        if sentinels.is_empty() {
            return Err(BackendError::Connect("no sentinel addresses".into()));
        }

        let params: Vec<String> = sentinels
            .iter()
            .map(|addr| format!("redis://{}/", addr))
            .collect();
        let node_info = SentinelNodeConnectionInfo {
            tls_mode: None,
            redis_connection_info: Some(RedisConnectionInfo {
                db: database,
                password: password.map(str::to_string),
                ..Default::default()
            }),
        };
        let client = SentinelClient::build(
            params,
            group.to_string(),
            Some(node_info),
            SentinelServerType::Master,
        )
        .map_err(|e| BackendError::Connect(e.to_string()))?;

        Ok(Self {
            group: group.to_string(),
            sentinels: sentinels.to_vec(),
            client: Mutex::new(client),
            cached: RwLock::new(None),
            command_timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BackendError> {
        let cached = self.cached.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let mut client = self.client.lock().await;
        // Another caller may have connected while we waited for the lock
        let cached = self.cached.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        debug!(group = %self.group, "Resolved primary through sentinels");
        *self.cached.write() = Some(conn.clone());
        Ok(conn)
    }

    async fn run(&self, command: Command) -> Result<Reply, BackendError> {
        let mut conn = self.connection().await?;
        let result = query(&mut conn, command).await;

        if let Err(err) = &result {
            if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
                warn!(group = %self.group, error = %err, "Dropping primary connection");
                self.cached.write().take();
            }
        }

        result.map_err(BackendError::from)
    }
}

#[async_trait]
impl Backend for FailoverBackend {
    async fn execute(&self, command: Command) -> Result<Reply, BackendError> {
        let limit = self.command_timeout;
        match tokio::time::timeout(limit, self.run(command)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit.as_millis() as u64)),
        }
    }

    fn describe(&self) -> String {
        format!("sentinel group '{}' via {:?}", self.group, self.sentinels)
    }
}

/// Issue one primitive and narrow its reply
async fn query(conn: &mut MultiplexedConnection, command: Command) -> Result<Reply, RedisError> {
    let reply = match command {
        Command::Ping => {
            let _: String = redis::cmd("PING").query_async(conn).await?;
            Reply::Ok
        }
        Command::DbSize => {
            let n: i64 = redis::cmd("DBSIZE").query_async(conn).await?;
            Reply::Int(n)
        }
        Command::Del { key } => {
            let n: i64 = redis::cmd("DEL").arg(&key).query_async(conn).await?;
            Reply::Int(n)
        }
        Command::Exists { key } => {
            let found: bool = redis::cmd("EXISTS").arg(&key).query_async(conn).await?;
            Reply::Bool(found)
        }
        Command::Expire { key, seconds } => {
            let set: bool = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(seconds)
                .query_async(conn)
                .await?;
            Reply::Bool(set)
        }
        Command::Get { key } => {
            let value: Option<String> = redis::cmd("GET").arg(&key).query_async(conn).await?;
            value.map_or(Reply::Nil, Reply::Str)
        }
        Command::Set { key, value, expire } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value);
            if let Some(seconds) = expire {
                cmd.arg("EX").arg(seconds);
            }
            let _: () = cmd.query_async(conn).await?;
            Reply::Ok
        }
        Command::HSet { key, field, value } => {
            let n: i64 = redis::cmd("HSET")
                .arg(&key)
                .arg(&field)
                .arg(&value)
                .query_async(conn)
                .await?;
            Reply::Int(n)
        }
        Command::HMSet { key, pairs } => {
            let mut cmd = redis::cmd("HMSET");
            cmd.arg(&key);
            for (field, value) in &pairs {
                cmd.arg(field).arg(value);
            }
            let _: () = cmd.query_async(conn).await?;
            Reply::Ok
        }
        Command::HGet { key, field } => {
            let value: Option<String> = redis::cmd("HGET")
                .arg(&key)
                .arg(&field)
                .query_async(conn)
                .await?;
            value.map_or(Reply::Nil, Reply::Str)
        }
        Command::HMGet { key, fields } => {
            let values: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(&key)
                .arg(&fields)
                .query_async(conn)
                .await?;
            Reply::Sparse(values)
        }
        Command::HGetAll { key } => {
            let map: BTreeMap<String, String> =
                redis::cmd("HGETALL").arg(&key).query_async(conn).await?;
            Reply::Map(map)
        }
        Command::HDel { key, fields } => {
            let n: i64 = redis::cmd("HDEL")
                .arg(&key)
                .arg(&fields)
                .query_async(conn)
                .await?;
            Reply::Int(n)
        }
        Command::SAdd { key, members } => {
            let n: i64 = redis::cmd("SADD")
                .arg(&key)
                .arg(&members)
                .query_async(conn)
                .await?;
            Reply::Int(n)
        }
        Command::SRem { key, members } => {
            let n: i64 = redis::cmd("SREM")
                .arg(&key)
                .arg(&members)
                .query_async(conn)
                .await?;
            Reply::Int(n)
        }
        Command::SMove {
            source,
            destination,
            member,
        } => {
            let moved: bool = redis::cmd("SMOVE")
                .arg(&source)
                .arg(&destination)
                .arg(&member)
                .query_async(conn)
                .await?;
            Reply::Bool(moved)
        }
        Command::SPop { key } => {
            let member: Option<String> = redis::cmd("SPOP").arg(&key).query_async(conn).await?;
            member.map_or(Reply::Nil, Reply::Str)
        }
        Command::SRandMember { key } => {
            let member: Option<String> =
                redis::cmd("SRANDMEMBER").arg(&key).query_async(conn).await?;
            member.map_or(Reply::Nil, Reply::Str)
        }
        Command::SCard { key } => {
            let n: i64 = redis::cmd("SCARD").arg(&key).query_async(conn).await?;
            Reply::Int(n)
        }
        Command::SIsMember { key, member } => {
            let found: bool = redis::cmd("SISMEMBER")
                .arg(&key)
                .arg(&member)
                .query_async(conn)
                .await?;
            Reply::Bool(found)
        }
        Command::SMembers { key } => {
            let members: Vec<String> = redis::cmd("SMEMBERS").arg(&key).query_async(conn).await?;
            Reply::List(members)
        }
        Command::ZAdd { key, score, member } => {
            let n: i64 = redis::cmd("ZADD")
                .arg(&key)
                .arg(score)
                .arg(&member)
                .query_async(conn)
                .await?;
            Reply::Int(n)
        }
        Command::ZRank { key, member } => {
            let rank: Option<i64> = redis::cmd("ZRANK")
                .arg(&key)
                .arg(&member)
                .query_async(conn)
                .await?;
            rank.map_or(Reply::Nil, Reply::Int)
        }
        Command::ZRevRank { key, member } => {
            let rank: Option<i64> = redis::cmd("ZREVRANK")
                .arg(&key)
                .arg(&member)
                .query_async(conn)
                .await?;
            rank.map_or(Reply::Nil, Reply::Int)
        }
        Command::ZRange { key, start, stop } => {
            let members: Vec<String> = redis::cmd("ZRANGE")
                .arg(&key)
                .arg(start)
                .arg(stop)
                .query_async(conn)
                .await?;
            Reply::List(members)
        }
        Command::LPush { key, values } => {
            let n: i64 = redis::cmd("LPUSH")
                .arg(&key)
                .arg(&values)
                .query_async(conn)
                .await?;
            Reply::Int(n)
        }
    };
    Ok(reply)
}

/// Production connector: sentinel-managed Redis groups
pub struct RedisConnector {
    command_timeout: Duration,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(command_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            command_timeout,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(
        &self,
        shard: &str,
        config: &ShardConfig,
        hosts: &[String],
    ) -> Result<Arc<dyn Backend>, BackendError> {
        let backend = FailoverBackend::new(
            &config.failover_group,
            hosts,
            config.database,
            config.password(),
            self.command_timeout,
        )?;

        let limit = self.connect_timeout;
        match tokio::time::timeout(limit, backend.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(BackendError::Connect(err.to_string())),
            Err(_) => return Err(BackendError::Timeout(limit.as_millis() as u64)),
        }

        info!(shard = %shard, backend = %backend.describe(), "Backend link established");
        Ok(Arc::new(backend))
    }
}
