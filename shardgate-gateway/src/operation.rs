//! Typed dispatcher operations
//!
//! Raw parameters are turned into an [`Operation`] before anything is routed,
//! so every parameter error is reported without touching a backend.

use std::fmt;

use crate::params::{parse_score, ParamError, Params};

/// Data-structure family of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    String,
    Hash,
    Set,
    SortedSet,
    List,
    Key,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::String => "string",
            Category::Hash => "hash",
            Category::Set => "set",
            Category::SortedSet => "sorted-set",
            Category::List => "list",
            Category::Key => "generic-key",
        };
        f.write_str(name)
    }
}

/// One validated request
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    StringSet { key: String, value: String, expire: Option<u64> },
    StringGet { key: String },

    HashSet { key: String, pairs: Vec<(String, String)>, expire: Option<u64> },
    HashGet { key: String, field: String },
    HashGetMany { key: String, fields: Vec<String> },
    HashGetAll { key: String },
    HashDelete { key: String, fields: Vec<String> },

    SetAdd { key: String, members: Vec<String>, expire: Option<u64> },
    SetRemove { key: String, members: Vec<String> },
    SetMove { key: String, destination: String, member: String },
    SetPop { key: String },
    SetRandomMember { key: String },
    SetCardinality { key: String },
    SetIsMember { key: String, member: String },
    SetMembers { key: String },

    ZSetAdd { key: String, score: f64, member: String, expire: Option<u64> },
    ZSetRank { key: String, member: String },
    ZSetRevRank { key: String, member: String },
    ZSetRange { key: String, start: i64, stop: i64 },

    ListPush { key: String, value: String, expire: Option<u64> },

    KeyDelete { key: String },
    KeyExists { key: String },
    KeyExpire { key: String, seconds: u64 },
}

impl Operation {
    /// Build an operation from its category, verb and raw parameters.
    ///
    /// Verbs per category:
    /// - string: `set`, `get`
    /// - hash: `hset`, `hget`, `hmget`, `hgetall`, `hdel`
    /// - set: `sadd`, `srem`, `smove`, `spop`, `srandmember`, `scard`,
    ///   `sismember`, `smembers`, `del`
    /// - sorted-set: `zadd`, `zrank`, `zrevrank`, `zrange`
    /// - list: `lpush`
    /// - generic-key: `del`, `exists`, `expire`
    ///
    /// An unknown verb is reported as a bad `type` parameter.
    pub fn parse(category: Category, verb: &str, params: &Params) -> Result<Self, ParamError> {
        let key = params.required("key")?;
        let op = match (category, verb) {
            (Category::String, "set") => Operation::StringSet {
                value: params.required("value")?,
                expire: params.expire()?,
                key,
            },
            (Category::String, "get") => Operation::StringGet { key },

            (Category::Hash, "hset") => Operation::HashSet {
                pairs: field_value_pairs(params)?,
                expire: params.expire()?,
                key,
            },
            (Category::Hash, "hget") => Operation::HashGet {
                field: params.required("field")?,
                key,
            },
            (Category::Hash, "hmget") => Operation::HashGetMany {
                fields: params.required_all("field")?,
                key,
            },
            (Category::Hash, "hgetall") => Operation::HashGetAll { key },
            (Category::Hash, "hdel") => Operation::HashDelete {
                fields: split_fields(params)?,
                key,
            },

            (Category::Set, "sadd") => Operation::SetAdd {
                members: params.required_all("member")?,
                expire: params.expire()?,
                key,
            },
            (Category::Set, "srem") => Operation::SetRemove {
                members: params.required_all("member")?,
                key,
            },
            (Category::Set, "smove") => Operation::SetMove {
                destination: params.required("destination")?,
                member: params.required("member")?,
                key,
            },
            (Category::Set, "spop") => Operation::SetPop { key },
            (Category::Set, "srandmember") => Operation::SetRandomMember { key },
            (Category::Set, "scard") => Operation::SetCardinality { key },
            (Category::Set, "sismember") => Operation::SetIsMember {
                member: params.required("member")?,
                key,
            },
            (Category::Set, "smembers") => Operation::SetMembers { key },
            (Category::Set, "del") => Operation::KeyDelete { key },

            (Category::SortedSet, "zadd") => {
                let (score, member) = score_and_member(params)?;
                Operation::ZSetAdd {
                    score,
                    member,
                    expire: params.expire()?,
                    key,
                }
            }
            (Category::SortedSet, "zrank") => Operation::ZSetRank {
                member: params.required("member")?,
                key,
            },
            (Category::SortedSet, "zrevrank") => Operation::ZSetRevRank {
                member: params.required("member")?,
                key,
            },
            (Category::SortedSet, "zrange") => Operation::ZSetRange {
                start: params.integer("start")?,
                stop: params.integer("end")?,
                key,
            },

            (Category::List, "lpush") => Operation::ListPush {
                value: params.required("value")?,
                expire: params.expire()?,
                key,
            },

            (Category::Key, "del") => Operation::KeyDelete { key },
            (Category::Key, "exists") => Operation::KeyExists { key },
            (Category::Key, "expire") => Operation::KeyExpire {
                seconds: params.expire()?.ok_or_else(|| ParamError::new("expire"))?,
                key,
            },

            _ => return Err(ParamError::new("type")),
        };
        Ok(op)
    }

    /// Key that decides the owning shard
    pub fn key(&self) -> &str {
        match self {
            Operation::StringSet { key, .. }
            | Operation::StringGet { key }
            | Operation::HashSet { key, .. }
            | Operation::HashGet { key, .. }
            | Operation::HashGetMany { key, .. }
            | Operation::HashGetAll { key }
            | Operation::HashDelete { key, .. }
            | Operation::SetAdd { key, .. }
            | Operation::SetRemove { key, .. }
            | Operation::SetMove { key, .. }
            | Operation::SetPop { key }
            | Operation::SetRandomMember { key }
            | Operation::SetCardinality { key }
            | Operation::SetIsMember { key, .. }
            | Operation::SetMembers { key }
            | Operation::ZSetAdd { key, .. }
            | Operation::ZSetRank { key, .. }
            | Operation::ZSetRevRank { key, .. }
            | Operation::ZSetRange { key, .. }
            | Operation::ListPush { key, .. }
            | Operation::KeyDelete { key }
            | Operation::KeyExists { key }
            | Operation::KeyExpire { key, .. } => key,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Operation::StringSet { .. } => "string.set",
            Operation::StringGet { .. } => "string.get",
            Operation::HashSet { .. } => "hash.set",
            Operation::HashGet { .. } => "hash.get",
            Operation::HashGetMany { .. } => "hash.get_many",
            Operation::HashGetAll { .. } => "hash.get_all",
            Operation::HashDelete { .. } => "hash.delete",
            Operation::SetAdd { .. } => "set.add",
            Operation::SetRemove { .. } => "set.remove",
            Operation::SetMove { .. } => "set.move",
            Operation::SetPop { .. } => "set.pop",
            Operation::SetRandomMember { .. } => "set.random_member",
            Operation::SetCardinality { .. } => "set.cardinality",
            Operation::SetIsMember { .. } => "set.is_member",
            Operation::SetMembers { .. } => "set.members",
            Operation::ZSetAdd { .. } => "zset.add",
            Operation::ZSetRank { .. } => "zset.rank",
            Operation::ZSetRevRank { .. } => "zset.rev_rank",
            Operation::ZSetRange { .. } => "zset.range",
            Operation::ListPush { .. } => "list.push",
            Operation::KeyDelete { .. } => "key.delete",
            Operation::KeyExists { .. } => "key.exists",
            Operation::KeyExpire { .. } => "key.expire",
        }
    }
}

/// Paired `field[]`/`value[]`; the counts must match
fn field_value_pairs(params: &Params) -> Result<Vec<(String, String)>, ParamError> {
    let fields = params.required_all("field")?;
    let values = params.required_all("value")?;
    if fields.len() != values.len() {
        return Err(ParamError::new("field and value diff"));
    }
    Ok(fields.into_iter().zip(values).collect())
}

/// Fields to delete; a single value may hold several space-separated names
fn split_fields(params: &Params) -> Result<Vec<String>, ParamError> {
    let fields: Vec<String> = params
        .all("field")
        .iter()
        .flat_map(|raw| raw.split_whitespace())
        .map(str::to_string)
        .collect();
    if fields.is_empty() {
        return Err(ParamError::new("field"));
    }
    Ok(fields)
}

/// `value="<score> <member>"`, or separate `score` and `member`
fn score_and_member(params: &Params) -> Result<(f64, String), ParamError> {
    if let Some(raw) = params.get("value").filter(|v| !v.is_empty()) {
        let mut parts = raw.splitn(2, ' ');
        let score = parts.next().unwrap_or_default();
        let member = parts.next().map(str::trim).unwrap_or_default();
        if member.is_empty() {
            return Err(ParamError::new("value"));
        }
        return Ok((parse_score(score, "value")?, member.to_string()));
    }
    let score = parse_score(&params.required("score")?, "score")?;
    Ok((score, params.required("member")?))
}
