//! In-process backend
//!
//! Follows Redis command semantics closely enough to stand in for a shard in
//! tests and local runs. One deliberate difference: containers emptied by a
//! removal (HDEL, SREM, SPOP) are kept as empty keys instead of being
//! dropped, so an existing-but-empty key can be told apart from a missing
//! one.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Backend, BackendError, Command, Connector, Reply};
use crate::config::ShardConfig;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    ZSet(Vec<(f64, String)>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// In-memory shard
#[derive(Default)]
pub struct MemoryBackend {
    name: String,
    data: Mutex<HashMap<String, Entry>>,
    calls: AtomicUsize,
    /// Command names that fail with an injected error
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Number of commands executed so far, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every future `command` (by wire name) fail
    pub fn fail_command(&self, command: &'static str) {
        self.failing.lock().insert(command);
    }

    /// Remaining time to live of `key`, if one is set
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let data = self.data.lock();
        data.get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Whether `key` exists (ignoring expired entries)
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.data.lock().get(key).map_or(false, |e| !e.is_expired(now))
    }

    fn apply(&self, command: Command) -> Result<Reply, BackendError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        data.retain(|_, entry| !entry.is_expired(now));

        let reply = match command {
            Command::Ping => Reply::Ok,
            Command::DbSize => Reply::Int(data.len() as i64),

            Command::Del { key } => Reply::Int(data.remove(&key).map_or(0, |_| 1)),
            Command::Exists { key } => Reply::Bool(data.contains_key(&key)),
            Command::Expire { key, seconds } => match data.get_mut(&key) {
                Some(entry) => {
                    entry.expires_at = Some(deadline(now, seconds, "expire")?);
                    Reply::Bool(true)
                }
                None => Reply::Bool(false),
            },

            Command::Get { key } => match data.get(&key).map(|e| &e.value) {
                None => Reply::Nil,
                Some(Value::Str(s)) => Reply::Str(s.clone()),
                Some(_) => return Err(wrongtype()),
            },
            Command::Set { key, value, expire } => {
                let mut entry = Entry::new(Value::Str(value));
                entry.expires_at = expire.map(|s| deadline(now, s, "set")).transpose()?;
                data.insert(key, entry);
                Reply::Ok
            }

            Command::HSet { key, field, value } => {
                let hash = hash_mut(&mut data, key)?;
                Reply::Int(hash.insert(field, value).map_or(1, |_| 0))
            }
            Command::HMSet { key, pairs } => {
                let hash = hash_mut(&mut data, key)?;
                hash.extend(pairs);
                Reply::Ok
            }
            Command::HGet { key, field } => match data.get(&key).map(|e| &e.value) {
                None => Reply::Nil,
                Some(Value::Hash(h)) => h.get(&field).cloned().map_or(Reply::Nil, Reply::Str),
                Some(_) => return Err(wrongtype()),
            },
            Command::HMGet { key, fields } => match data.get(&key).map(|e| &e.value) {
                None => Reply::Sparse(vec![None; fields.len()]),
                Some(Value::Hash(h)) => {
                    Reply::Sparse(fields.iter().map(|f| h.get(f).cloned()).collect())
                }
                Some(_) => return Err(wrongtype()),
            },
            Command::HGetAll { key } => match data.get(&key).map(|e| &e.value) {
                None => Reply::Map(BTreeMap::new()),
                Some(Value::Hash(h)) => Reply::Map(h.clone()),
                Some(_) => return Err(wrongtype()),
            },
            Command::HDel { key, fields } => match data.get_mut(&key).map(|e| &mut e.value) {
                None => Reply::Int(0),
                Some(Value::Hash(h)) => {
                    let removed = fields.iter().filter(|f| h.remove(*f).is_some()).count();
                    Reply::Int(removed as i64)
                }
                Some(_) => return Err(wrongtype()),
            },

            Command::SAdd { key, members } => {
                let set = set_mut(&mut data, key)?;
                let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
                Reply::Int(added as i64)
            }
            Command::SRem { key, members } => match data.get_mut(&key).map(|e| &mut e.value) {
                None => Reply::Int(0),
                Some(Value::Set(s)) => {
                    let removed = members.iter().filter(|m| s.remove(*m)).count();
                    Reply::Int(removed as i64)
                }
                Some(_) => return Err(wrongtype()),
            },
            Command::SMove {
                source,
                destination,
                member,
            } => {
                let moved = match data.get_mut(&source).map(|e| &mut e.value) {
                    None => false,
                    Some(Value::Set(s)) => s.remove(&member),
                    Some(_) => return Err(wrongtype()),
                };
                if moved {
                    set_mut(&mut data, destination)?.insert(member);
                }
                Reply::Bool(moved)
            }
            Command::SPop { key } => match data.get_mut(&key).map(|e| &mut e.value) {
                None => Reply::Nil,
                Some(Value::Set(s)) => s.pop_first().map_or(Reply::Nil, Reply::Str),
                Some(_) => return Err(wrongtype()),
            },
            Command::SRandMember { key } => match data.get(&key).map(|e| &e.value) {
                None => Reply::Nil,
                Some(Value::Set(s)) => s.iter().next().cloned().map_or(Reply::Nil, Reply::Str),
                Some(_) => return Err(wrongtype()),
            },
            Command::SCard { key } => match data.get(&key).map(|e| &e.value) {
                None => Reply::Int(0),
                Some(Value::Set(s)) => Reply::Int(s.len() as i64),
                Some(_) => return Err(wrongtype()),
            },
            Command::SIsMember { key, member } => match data.get(&key).map(|e| &e.value) {
                None => Reply::Bool(false),
                Some(Value::Set(s)) => Reply::Bool(s.contains(&member)),
                Some(_) => return Err(wrongtype()),
            },
            Command::SMembers { key } => match data.get(&key).map(|e| &e.value) {
                None => Reply::List(vec![]),
                Some(Value::Set(s)) => Reply::List(s.iter().cloned().collect()),
                Some(_) => return Err(wrongtype()),
            },

            Command::ZAdd { key, score, member } => {
                let zset = zset_mut(&mut data, key)?;
                let added = match zset.iter().position(|(_, m)| *m == member) {
                    Some(pos) => {
                        zset[pos].0 = score;
                        0
                    }
                    None => {
                        zset.push((score, member));
                        1
                    }
                };
                zset.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                Reply::Int(added)
            }
            Command::ZRank { key, member } => zrank(&data, &key, &member, false)?,
            Command::ZRevRank { key, member } => zrank(&data, &key, &member, true)?,
            Command::ZRange { key, start, stop } => match data.get(&key).map(|e| &e.value) {
                None => Reply::List(vec![]),
                Some(Value::ZSet(z)) => {
                    let members = match normalize_range(start, stop, z.len()) {
                        Some((from, to)) => z[from..=to].iter().map(|(_, m)| m.clone()).collect(),
                        None => vec![],
                    };
                    Reply::List(members)
                }
                Some(_) => return Err(wrongtype()),
            },

            Command::LPush { key, values } => {
                let entry = data
                    .entry(key)
                    .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
                match &mut entry.value {
                    Value::List(list) => {
                        for value in values {
                            list.push_front(value);
                        }
                        Reply::Int(list.len() as i64)
                    }
                    _ => return Err(wrongtype()),
                }
            }
        };
        Ok(reply)
    }
}

/// Expiry instant `seconds` from `now`, rejected the way Redis rejects
/// out-of-range TTLs
fn deadline(now: Instant, seconds: u64, command: &str) -> Result<Instant, BackendError> {
    now.checked_add(Duration::from_secs(seconds)).ok_or_else(|| {
        BackendError::Command(format!("ERR invalid expire time in '{}' command", command))
    })
}

fn wrongtype() -> BackendError {
    BackendError::Command(WRONGTYPE.to_string())
}

fn hash_mut(
    data: &mut HashMap<String, Entry>,
    key: String,
) -> Result<&mut BTreeMap<String, String>, BackendError> {
    let entry = data
        .entry(key)
        .or_insert_with(|| Entry::new(Value::Hash(BTreeMap::new())));
    match &mut entry.value {
        Value::Hash(h) => Ok(h),
        _ => Err(wrongtype()),
    }
}

fn set_mut(
    data: &mut HashMap<String, Entry>,
    key: String,
) -> Result<&mut BTreeSet<String>, BackendError> {
    let entry = data
        .entry(key)
        .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
    match &mut entry.value {
        Value::Set(s) => Ok(s),
        _ => Err(wrongtype()),
    }
}

fn zset_mut(
    data: &mut HashMap<String, Entry>,
    key: String,
) -> Result<&mut Vec<(f64, String)>, BackendError> {
    let entry = data
        .entry(key)
        .or_insert_with(|| Entry::new(Value::ZSet(Vec::new())));
    match &mut entry.value {
        Value::ZSet(z) => Ok(z),
        _ => Err(wrongtype()),
    }
}

fn zrank(
    data: &HashMap<String, Entry>,
    key: &str,
    member: &str,
    reverse: bool,
) -> Result<Reply, BackendError> {
    match data.get(key).map(|e| &e.value) {
        None => Ok(Reply::Nil),
        Some(Value::ZSet(z)) => Ok(z
            .iter()
            .position(|(_, m)| m == member)
            .map(|pos| if reverse { z.len() - 1 - pos } else { pos })
            .map_or(Reply::Nil, |rank| Reply::Int(rank as i64))),
        Some(_) => Err(wrongtype()),
    }
}

/// Redis index rules: negatives count from the end, out-of-range clamps
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn execute(&self, command: Command) -> Result<Reply, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(command.name()) {
            return Err(BackendError::Command(format!(
                "ERR injected failure for {}",
                command.name()
            )));
        }
        self.apply(command)
    }

    fn describe(&self) -> String {
        format!("memory backend '{}'", self.name)
    }
}

/// Connector handing out [`MemoryBackend`]s.
///
/// Shards listed with [`MemoryConnector::refuse`] fail to connect, which
/// mimics a group whose sentinels are unreachable.
#[derive(Default)]
pub struct MemoryConnector {
    backends: Mutex<HashMap<String, Arc<MemoryBackend>>>,
    refused: Mutex<HashSet<String>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections for `shard`
    pub fn refuse(&self, shard: &str) {
        self.refused.lock().insert(shard.to_string());
    }

    /// Backend created for `shard`, if it was connected
    pub fn backend(&self, shard: &str) -> Option<Arc<MemoryBackend>> {
        self.backends.lock().get(shard).cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        shard: &str,
        _config: &ShardConfig,
        hosts: &[String],
    ) -> Result<Arc<dyn Backend>, BackendError> {
        if hosts.is_empty() {
            return Err(BackendError::Connect("no hosts".into()));
        }
        if self.refused.lock().contains(shard) {
            return Err(BackendError::Connect(format!(
                "connection refused by {}",
                hosts.join(",")
            )));
        }

        let backend = self
            .backends
            .lock()
            .entry(shard.to_string())
            .or_insert_with(|| Arc::new(MemoryBackend::new(shard)))
            .clone();
        backend.ping().await?;
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> String {
        k.to_string()
    }

    #[tokio::test]
    async fn test_string_set_get() {
        let backend = MemoryBackend::new("a");
        backend
            .execute(Command::Set { key: key("k"), value: key("v"), expire: None })
            .await
            .unwrap();
        let reply = backend.execute(Command::Get { key: key("k") }).await.unwrap();
        assert_eq!(reply, Reply::Str(key("v")));

        let missing = backend.execute(Command::Get { key: key("nope") }).await.unwrap();
        assert_eq!(missing, Reply::Nil);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_set_with_expire_records_ttl() {
        let backend = MemoryBackend::new("a");
        backend
            .execute(Command::Set { key: key("k"), value: key("v"), expire: Some(60) })
            .await
            .unwrap();
        let ttl = backend.ttl("k").unwrap();
        assert!(ttl <= Duration::from_secs(60) && ttl > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_rejected() {
        let backend = MemoryBackend::new("a");
        let err = backend
            .execute(Command::Set { key: key("k"), value: key("v"), expire: Some(u64::MAX) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "ERR invalid expire time in 'set' command");
        assert!(!backend.contains_key("k"));

        backend
            .execute(Command::SAdd { key: key("s"), members: vec![key("m")] })
            .await
            .unwrap();
        let err = backend
            .execute(Command::Expire { key: key("s"), seconds: u64::MAX })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Command(_)));
        assert_eq!(backend.ttl("s"), None);
    }

    #[tokio::test]
    async fn test_emptied_hash_is_kept() {
        let backend = MemoryBackend::new("a");
        backend
            .execute(Command::HSet { key: key("h"), field: key("f"), value: key("v") })
            .await
            .unwrap();
        backend
            .execute(Command::HDel { key: key("h"), fields: vec![key("f")] })
            .await
            .unwrap();
        assert!(backend.contains_key("h"));
        let all = backend.execute(Command::HGetAll { key: key("h") }).await.unwrap();
        assert_eq!(all, Reply::Map(BTreeMap::new()));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let backend = MemoryBackend::new("a");
        backend
            .execute(Command::Set { key: key("k"), value: key("v"), expire: None })
            .await
            .unwrap();
        let err = backend
            .execute(Command::SAdd { key: key("k"), members: vec![key("m")] })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), WRONGTYPE);
    }

    #[tokio::test]
    async fn test_zset_rank_and_range() {
        let backend = MemoryBackend::new("a");
        for (score, member) in [(3.0, "c"), (1.0, "a"), (2.0, "b")] {
            backend
                .execute(Command::ZAdd { key: key("z"), score, member: key(member) })
                .await
                .unwrap();
        }
        let rank = backend
            .execute(Command::ZRank { key: key("z"), member: key("c") })
            .await
            .unwrap();
        assert_eq!(rank, Reply::Int(2));
        let rev = backend
            .execute(Command::ZRevRank { key: key("z"), member: key("c") })
            .await
            .unwrap();
        assert_eq!(rev, Reply::Int(0));
        let range = backend
            .execute(Command::ZRange { key: key("z"), start: 0, stop: -1 })
            .await
            .unwrap();
        assert_eq!(range, Reply::List(vec![key("a"), key("b"), key("c")]));
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range(0, -1, 3), Some((0, 2)));
        assert_eq!(normalize_range(1, 10, 3), Some((1, 2)));
        assert_eq!(normalize_range(-2, -1, 3), Some((1, 2)));
        assert_eq!(normalize_range(2, 1, 3), None);
        assert_eq!(normalize_range(0, -1, 0), None);
        assert_eq!(normalize_range(5, 6, 3), None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = MemoryBackend::new("a");
        backend.fail_command("EXPIRE");
        let err = backend
            .execute(Command::Expire { key: key("k"), seconds: 5 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("EXPIRE"));
    }

    #[tokio::test]
    async fn test_connector_refusal() {
        let connector = MemoryConnector::new();
        connector.refuse("b");
        let config = ShardConfig {
            node_label: "redis:b".into(),
            failover_group: "mymaster".into(),
            port: 26379,
            password: String::new(),
            database: 0,
        };
        let hosts = vec!["node-1:26379".to_string()];
        assert!(connector.connect("a", &config, &hosts).await.is_ok());
        assert!(connector.connect("b", &config, &hosts).await.is_err());
        assert!(connector.connect("c", &config, &[]).await.is_err());
        assert!(connector.backend("a").is_some());
        assert!(connector.backend("b").is_none());
    }
}
