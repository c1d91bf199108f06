//! Response envelope
//!
//! Every call answers with one JSON object:
//!
//! | `_type` | meaning                                  | payload           |
//! |---------|------------------------------------------|-------------------|
//! | `"0"`   | success                                  | `val` or `_msg`   |
//! | `"-1"`  | backend, routing or internal failure     | `_msg` (verbatim) |
//! | `"1"`   | malformed parameter, backend not called  | `_msg`            |
//! | `"2"`   | key exists but holds nothing             | `val` (empty)     |
//! | `"3"`   | key or member not found                  | `_msg: "nil"`     |

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

pub const STATUS_OK: &str = "0";
pub const STATUS_ERROR: &str = "-1";
pub const STATUS_PARAM: &str = "1";
pub const STATUS_EMPTY: &str = "2";
pub const STATUS_NOT_FOUND: &str = "3";

/// Payload of a successful call
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Rendered as a decimal string, as existing clients expect
    Int(i64),
    Str(String),
    Bool(bool),
    List(Vec<String>),
    /// List whose slots may be missing; missing slots render as `null`
    Sparse(Vec<Option<String>>),
    Map(BTreeMap<String, String>),
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Int(n) => serializer.serialize_str(&n.to_string()),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Sparse(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

/// Uniform result of one dispatcher call
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Success without a value
    Done,
    /// Success with a value
    Value(Value),
    /// Backend or internal failure
    Error(String),
    /// Malformed parameter
    Param(String),
    /// Key exists but is empty
    Empty(Value),
    /// Key or member absent
    NotFound,
}

impl Envelope {
    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error(message.into())
    }

    /// Wire status code
    pub fn status(&self) -> &'static str {
        match self {
            Envelope::Done | Envelope::Value(_) => STATUS_OK,
            Envelope::Error(_) => STATUS_ERROR,
            Envelope::Param(_) => STATUS_PARAM,
            Envelope::Empty(_) => STATUS_EMPTY,
            Envelope::NotFound => STATUS_NOT_FOUND,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Done | Envelope::Value(_))
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("_type", self.status())?;
        match self {
            Envelope::Done => map.serialize_entry("_msg", "ok")?,
            Envelope::Value(value) | Envelope::Empty(value) => map.serialize_entry("val", value)?,
            Envelope::Error(message) => map.serialize_entry("_msg", message)?,
            Envelope::Param(name) => {
                map.serialize_entry("_msg", &format!("Param '{}' Error.", name))?
            }
            Envelope::NotFound => map.serialize_entry("_msg", "nil")?,
        }
        map.end()
    }
}
