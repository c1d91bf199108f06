//! Request parameters
//!
//! Parameters arrive from the query string, a urlencoded or multipart form
//! body and path segments. Names may repeat (`field=f1&field=f2`) and order
//! is kept.

use thiserror::Error;

/// Largest TTL the backend accepts; its millisecond form must fit an i64
pub const MAX_EXPIRE_SECONDS: u64 = (i64::MAX / 1000) as u64;

/// A missing, empty or unparsable parameter. Carries the parameter name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Param '{0}' Error.")]
pub struct ParamError(pub String);

impl ParamError {
    pub fn new(name: impl Into<String>) -> Self {
        ParamError(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Ordered multi-map of request parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect parameters from a urlencoded body followed by the query
    /// string. Single lookups therefore prefer body values.
    pub fn from_request(query: Option<&str>, body: &[u8]) -> Self {
        let mut params = Self {
            pairs: form_urlencoded::parse(body).into_owned().collect(),
        };
        if let Some(query) = query {
            params.extend_query(query);
        }
        params
    }

    /// Append the pairs of a urlencoded query string
    pub fn extend_query(&mut self, query: &str) {
        self.pairs
            .extend(form_urlencoded::parse(query.as_bytes()).into_owned());
    }

    /// Parse a bare urlencoded string
    pub fn parse(encoded: &str) -> Self {
        Self::from_request(None, encoded.as_bytes())
    }

    /// Set `name` from a path segment. Path values shadow query and body.
    pub fn with_path(mut self, name: &str, value: &str) -> Self {
        self.pairs.insert(0, (name.to_string(), value.to_string()));
        self
    }

    /// Append one pair
    pub fn push(&mut self, name: &str, value: &str) {
        self.pairs.push((name.to_string(), value.to_string()));
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `name`, in arrival order, empty values dropped
    pub fn all(&self, name: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, v)| k == name && !v.is_empty())
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Non-empty value of `name`
    pub fn required(&self, name: &str) -> Result<String, ParamError> {
        match self.get(name) {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => Err(ParamError::new(name)),
        }
    }

    /// At least one non-empty value of `name`
    pub fn required_all(&self, name: &str) -> Result<Vec<String>, ParamError> {
        let values = self.all(name);
        if values.is_empty() {
            return Err(ParamError::new(name));
        }
        Ok(values)
    }

    /// Required signed integer
    pub fn integer(&self, name: &str) -> Result<i64, ParamError> {
        self.required(name)?
            .trim()
            .parse()
            .map_err(|_| ParamError::new(name))
    }

    /// Optional TTL in seconds. Absent or empty means no expiry. Only
    /// `1..=MAX_EXPIRE_SECONDS` is accepted; zero would delete the key as
    /// soon as it was written.
    pub fn expire(&self) -> Result<Option<u64>, ParamError> {
        match self.get("expire") {
            None | Some("") => Ok(None),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(seconds) if (1..=MAX_EXPIRE_SECONDS).contains(&seconds) => Ok(Some(seconds)),
                _ => Err(ParamError::new("expire")),
            },
        }
    }
}

/// Parse a finite sorted-set score
pub fn parse_score(raw: &str, name: &str) -> Result<f64, ParamError> {
    match raw.trim().parse::<f64>() {
        Ok(score) if score.is_finite() => Ok(score),
        _ => Err(ParamError::new(name)),
    }
}
