//! Request dispatcher
//!
//! Lowers one [`Operation`] to backend commands on the shard that owns its
//! key and folds the outcome into an [`Envelope`]. Stateless apart from the
//! shared [`ShardConnections`]; nothing is retried.

use std::sync::Arc;
use tracing::{debug, error, warn};

use shardgate_core::{Backend, BackendError, Command, Reply};
use shardgate_router_core::ShardConnections;

use crate::envelope::{Envelope, Value};
use crate::operation::{Category, Operation};
use crate::params::Params;

pub struct Dispatcher {
    connections: Arc<ShardConnections>,
}

impl Dispatcher {
    pub fn new(connections: Arc<ShardConnections>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<ShardConnections> {
        &self.connections
    }

    /// Parse and run one request
    pub async fn handle(&self, category: Category, verb: &str, params: &Params) -> Envelope {
        match Operation::parse(category, verb, params) {
            Ok(op) => self.dispatch(op).await,
            Err(err) => {
                debug!(category = %category, verb = %verb, error = %err, "Rejected parameters");
                Envelope::Param(err.0)
            }
        }
    }

    /// Route `op` by its key and run it
    pub async fn dispatch(&self, op: Operation) -> Envelope {
        let name = op.name();
        let (shard, backend) = match self.connections.route(op.key()) {
            Ok(route) => route,
            Err(err) => {
                error!(op = name, key = %op.key(), error = %err, "Routing failed");
                return Envelope::error(err.to_string());
            }
        };
        debug!(op = name, key = %op.key(), shard = %shard, "Dispatching");

        match execute(backend.as_ref(), op).await {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(op = name, shard = %shard, error = %err, "Backend call failed");
                Envelope::error(err.to_string())
            }
        }
    }

    /// Number of keys held by one admitted shard
    pub async fn shard_size(&self, shard: &str) -> Envelope {
        let backend = match self.connections.get(shard) {
            Ok(backend) => backend,
            Err(err) => return Envelope::error(err.to_string()),
        };
        match backend.execute(Command::DbSize).await.and_then(|r| r.into_int("DBSIZE")) {
            Ok(n) => Envelope::Value(Value::Int(n)),
            Err(err) => {
                warn!(shard = %shard, error = %err, "DBSIZE failed");
                Envelope::error(err.to_string())
            }
        }
    }
}

async fn execute(backend: &dyn Backend, op: Operation) -> Result<Envelope, BackendError> {
    let envelope = match op {
        Operation::StringSet { key, value, expire } => {
            backend.execute(Command::Set { key, value, expire }).await?;
            Envelope::Done
        }
        Operation::StringGet { key } => lookup(backend.execute(Command::Get { key }).await?, "GET")?,

        Operation::HashSet { key, mut pairs, expire } => {
            let write = if pairs.len() == 1 {
                let (field, value) = pairs.remove(0);
                Command::HSet {
                    key: key.clone(),
                    field,
                    value,
                }
            } else {
                Command::HMSet {
                    key: key.clone(),
                    pairs,
                }
            };
            write_then_expire(backend, write, key, expire).await?;
            Envelope::Done
        }
        Operation::HashGet { key, field } => {
            lookup(backend.execute(Command::HGet { key, field }).await?, "HGET")?
        }
        Operation::HashGetMany { key, fields } => {
            match backend.execute(Command::HMGet { key, fields }).await? {
                Reply::Sparse(items) => Envelope::Value(Value::Sparse(items)),
                other => return Err(unexpected("HMGET", other)),
            }
        }
        Operation::HashGetAll { key } => {
            let entries = match backend.execute(Command::HGetAll { key: key.clone() }).await? {
                Reply::Map(entries) => entries,
                other => return Err(unexpected("HGETALL", other)),
            };
            if !entries.is_empty() {
                Envelope::Value(Value::Map(entries))
            } else if backend
                .execute(Command::Exists { key })
                .await?
                .into_bool("EXISTS")?
            {
                Envelope::Empty(Value::Map(entries))
            } else {
                Envelope::NotFound
            }
        }
        Operation::HashDelete { key, fields } => {
            let removed = backend
                .execute(Command::HDel { key, fields })
                .await?
                .into_int("HDEL")?;
            Envelope::Value(Value::Int(removed))
        }

        Operation::SetAdd { key, members, expire } => {
            let write = Command::SAdd {
                key: key.clone(),
                members,
            };
            write_then_expire(backend, write, key, expire).await?;
            Envelope::Done
        }
        Operation::SetRemove { key, members } => {
            let removed = backend
                .execute(Command::SRem { key, members })
                .await?
                .into_int("SREM")?;
            Envelope::Value(Value::Int(removed))
        }
        Operation::SetMove {
            key,
            destination,
            member,
        } => {
            // Runs on the source key's shard; a destination owned by another
            // shard is still written there.
            let moved = backend
                .execute(Command::SMove {
                    source: key,
                    destination,
                    member,
                })
                .await?
                .into_bool("SMOVE")?;
            Envelope::Value(Value::Bool(moved))
        }
        Operation::SetPop { key } => lookup(backend.execute(Command::SPop { key }).await?, "SPOP")?,
        Operation::SetRandomMember { key } => lookup(
            backend.execute(Command::SRandMember { key }).await?,
            "SRANDMEMBER",
        )?,
        Operation::SetCardinality { key } => {
            let n = backend.execute(Command::SCard { key }).await?.into_int("SCARD")?;
            Envelope::Value(Value::Int(n))
        }
        Operation::SetIsMember { key, member } => {
            let found = backend
                .execute(Command::SIsMember { key, member })
                .await?
                .into_bool("SISMEMBER")?;
            Envelope::Value(Value::Bool(found))
        }
        Operation::SetMembers { key } => list(backend.execute(Command::SMembers { key }).await?, "SMEMBERS")?,

        Operation::ZSetAdd {
            key,
            score,
            member,
            expire,
        } => {
            let write = Command::ZAdd {
                key: key.clone(),
                score,
                member,
            };
            write_then_expire(backend, write, key, expire).await?;
            Envelope::Done
        }
        Operation::ZSetRank { key, member } => {
            rank(backend.execute(Command::ZRank { key, member }).await?, "ZRANK")?
        }
        Operation::ZSetRevRank { key, member } => {
            rank(backend.execute(Command::ZRevRank { key, member }).await?, "ZREVRANK")?
        }
        Operation::ZSetRange { key, start, stop } => list(
            backend.execute(Command::ZRange { key, start, stop }).await?,
            "ZRANGE",
        )?,

        Operation::ListPush { key, value, expire } => {
            let write = Command::LPush {
                key: key.clone(),
                values: vec![value],
            };
            write_then_expire(backend, write, key, expire).await?;
            Envelope::Done
        }

        Operation::KeyDelete { key } => {
            backend.execute(Command::Del { key }).await?;
            Envelope::Done
        }
        Operation::KeyExists { key } => {
            let found = backend.execute(Command::Exists { key }).await?.into_bool("EXISTS")?;
            Envelope::Value(Value::Bool(found))
        }
        Operation::KeyExpire { key, seconds } => {
            let set = backend
                .execute(Command::Expire { key, seconds })
                .await?
                .into_bool("EXPIRE")?;
            if set {
                Envelope::Done
            } else {
                Envelope::NotFound
            }
        }
    };
    Ok(envelope)
}

/// Run a collection write, then attach its TTL.
///
/// A failed EXPIRE leaves a key that would never expire; it is deleted again
/// and the EXPIRE error is returned.
async fn write_then_expire(
    backend: &dyn Backend,
    write: Command,
    key: String,
    expire: Option<u64>,
) -> Result<(), BackendError> {
    backend.execute(write).await?;

    let Some(seconds) = expire else {
        return Ok(());
    };
    if let Err(err) = backend
        .execute(Command::Expire {
            key: key.clone(),
            seconds,
        })
        .await
    {
        warn!(key = %key, error = %err, "EXPIRE failed, deleting key");
        if let Err(del_err) = backend.execute(Command::Del { key: key.clone() }).await {
            error!(key = %key, error = %del_err, "Compensating delete failed");
        }
        return Err(err);
    }
    Ok(())
}

/// Single string value, NIL as not-found
fn lookup(reply: Reply, command: &'static str) -> Result<Envelope, BackendError> {
    match reply {
        Reply::Str(s) => Ok(Envelope::Value(Value::Str(s))),
        Reply::Nil => Ok(Envelope::NotFound),
        other => Err(unexpected(command, other)),
    }
}

/// Integer rank, NIL as not-found
fn rank(reply: Reply, command: &'static str) -> Result<Envelope, BackendError> {
    match reply {
        Reply::Int(n) => Ok(Envelope::Value(Value::Int(n))),
        Reply::Nil => Ok(Envelope::NotFound),
        other => Err(unexpected(command, other)),
    }
}

fn list(reply: Reply, command: &'static str) -> Result<Envelope, BackendError> {
    match reply {
        Reply::List(items) => Ok(Envelope::Value(Value::List(items))),
        other => Err(unexpected(command, other)),
    }
}

fn unexpected(command: &'static str, reply: Reply) -> BackendError {
    BackendError::UnexpectedReply {
        command,
        reply: format!("{:?}", reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgate_core::MemoryBackend;

    fn single_shard() -> (Dispatcher, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new("A"));
        let connections = Arc::new(ShardConnections::new(16));
        connections.insert("A", backend.clone());
        (Dispatcher::new(connections), backend)
    }

    async fn call(dispatcher: &Dispatcher, category: Category, verb: &str, query: &str) -> Envelope {
        dispatcher.handle(category, verb, &Params::parse(query)).await
    }

    #[tokio::test]
    async fn test_string_round_trip() {
        let (dispatcher, _) = single_shard();
        assert_eq!(call(&dispatcher, Category::String, "set", "key=k1&value=v1").await, Envelope::Done);
        assert_eq!(
            call(&dispatcher, Category::String, "get", "key=k1").await,
            Envelope::Value(Value::Str("v1".into()))
        );
        assert_eq!(call(&dispatcher, Category::String, "get", "key=nope").await, Envelope::NotFound);
    }

    #[tokio::test]
    async fn test_param_error_makes_no_calls() {
        let (dispatcher, backend) = single_shard();
        let envelope = call(&dispatcher, Category::Hash, "hset", "key=h&field=f1&field=f2&value=a").await;
        assert_eq!(envelope, Envelope::Param("field and value diff".into()));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_huge_expire_rejected_before_backend() {
        let (dispatcher, backend) = single_shard();
        let envelope = call(
            &dispatcher,
            Category::String,
            "set",
            "key=k&value=v&expire=18446744073709551615",
        )
        .await;
        assert_eq!(envelope, Envelope::Param("expire".into()));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_expire_rejected_for_every_category() {
        let (dispatcher, backend) = single_shard();
        let writes = [
            (Category::String, "set", "key=k&value=v&expire=0"),
            (Category::Hash, "hset", "key=h&field=f&value=v&expire=0"),
            (Category::Set, "sadd", "key=s&member=m&expire=0"),
            (Category::SortedSet, "zadd", "key=z&value=1+m&expire=0"),
            (Category::List, "lpush", "key=l&value=v&expire=0"),
            (Category::Key, "expire", "key=k&expire=0"),
        ];
        for (category, verb, query) in writes {
            assert_eq!(
                call(&dispatcher, category, verb, query).await,
                Envelope::Param("expire".into()),
                "{} {}",
                category,
                verb
            );
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_field_uses_hset() {
        let (dispatcher, backend) = single_shard();
        backend.fail_command("HMSET");
        assert_eq!(
            call(&dispatcher, Category::Hash, "hset", "key=h&field=f1&value=a").await,
            Envelope::Done
        );
        assert!(matches!(
            call(&dispatcher, Category::Hash, "hset", "key=h&field=f1&field=f2&value=a&value=b").await,
            Envelope::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_backend_error_is_verbatim() {
        let (dispatcher, _) = single_shard();
        call(&dispatcher, Category::String, "set", "key=k&value=v").await;
        let envelope = call(&dispatcher, Category::Hash, "hgetall", "key=k").await;
        match envelope {
            Envelope::Error(message) => assert!(message.starts_with("WRONGTYPE")),
            other => panic!("expected error envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rank_of_missing_member() {
        let (dispatcher, _) = single_shard();
        call(&dispatcher, Category::SortedSet, "zadd", "key=z&value=1+a").await;
        assert_eq!(
            call(&dispatcher, Category::SortedSet, "zrank", "key=z&member=a").await,
            Envelope::Value(Value::Int(0))
        );
        assert_eq!(
            call(&dispatcher, Category::SortedSet, "zrank", "key=z&member=b").await,
            Envelope::NotFound
        );
    }

    #[tokio::test]
    async fn test_empty_ring() {
        let dispatcher = Dispatcher::new(Arc::new(ShardConnections::new(16)));
        let envelope = call(&dispatcher, Category::String, "get", "key=k").await;
        assert_eq!(envelope.status(), "-1");
    }

    #[tokio::test]
    async fn test_shard_size() {
        let (dispatcher, _) = single_shard();
        call(&dispatcher, Category::String, "set", "key=a&value=1").await;
        call(&dispatcher, Category::String, "set", "key=b&value=2").await;
        assert_eq!(dispatcher.shard_size("A").await, Envelope::Value(Value::Int(2)));
        assert_eq!(dispatcher.shard_size("Z").await.status(), "-1");
    }
}
