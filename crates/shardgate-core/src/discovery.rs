//! Cluster membership discovery
//!
//! Turns a shard's `key:value` label selector into the hostnames of the
//! nodes currently carrying that label. Only used while admitting shards.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{parse_selector, DiscoveryConfig};

/// Node label holding the node's hostname
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Discovery error types
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Selector matched zero nodes
    #[error("no nodes match selector '{0}'")]
    NoMatchingNodes(String),

    /// Selector is not a single `key:value` pair
    #[error("invalid node selector '{0}'")]
    InvalidSelector(String),

    /// Node-listing API unreachable or failed
    #[error("node listing request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Node-listing API answered with something other than a node list
    #[error("malformed node list: {0}")]
    Malformed(String),
}

/// Resolves a label selector to hostnames
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    /// Hostnames of the nodes matching `selector`; never empty on success
    async fn discover(&self, selector: &str) -> Result<Vec<String>, DiscoveryError>;
}

/// Resolver backed by the Kubernetes node-listing API
pub struct KubeNodeResolver {
    url: String,
    client: reqwest::Client,
}

impl KubeNodeResolver {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            url: config.nodes_url(),
            client,
        })
    }
}

#[async_trait]
impl MembershipResolver for KubeNodeResolver {
    async fn discover(&self, selector: &str) -> Result<Vec<String>, DiscoveryError> {
        let (key, value) = parse_selector(selector)
            .ok_or_else(|| DiscoveryError::InvalidSelector(selector.to_string()))?;

        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let hosts = hosts_matching(&body, key, value)?;
        debug!(selector = %selector, count = hosts.len(), "Node discovery finished");
        if hosts.is_empty() {
            return Err(DiscoveryError::NoMatchingNodes(selector.to_string()));
        }
        Ok(hosts)
    }
}

/// Extract the hostnames of nodes whose label `key` equals `value`
pub fn hosts_matching(body: &Value, key: &str, value: &str) -> Result<Vec<String>, DiscoveryError> {
    let items = body
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| DiscoveryError::Malformed("missing 'items' array".into()))?;

    let hosts = items
        .iter()
        .filter_map(|node| node.pointer("/metadata/labels"))
        .filter(|labels| labels.get(key).and_then(Value::as_str) == Some(value))
        .filter_map(|labels| labels.get(HOSTNAME_LABEL).and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    Ok(hosts)
}

/// Fixed selector -> hosts table
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the hosts returned for `selector`
    pub fn with_hosts(mut self, selector: &str, hosts: &[&str]) -> Self {
        self.table.insert(
            selector.to_string(),
            hosts.iter().map(|h| h.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl MembershipResolver for StaticResolver {
    async fn discover(&self, selector: &str) -> Result<Vec<String>, DiscoveryError> {
        if parse_selector(selector).is_none() {
            return Err(DiscoveryError::InvalidSelector(selector.to_string()));
        }
        match self.table.get(selector) {
            Some(hosts) if !hosts.is_empty() => Ok(hosts.clone()),
            _ => Err(DiscoveryError::NoMatchingNodes(selector.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(hostname: &str, role: &str) -> Value {
        json!({
            "metadata": {
                "name": hostname,
                "labels": {
                    "kubernetes.io/hostname": hostname,
                    "redis": role,
                }
            }
        })
    }

    #[test]
    fn test_hosts_matching_filters_by_label() {
        let body = json!({
            "kind": "NodeList",
            "items": [node("node-1", "cache-a"), node("node-2", "cache-b"), node("node-3", "cache-a")]
        });
        let hosts = hosts_matching(&body, "redis", "cache-a").unwrap();
        assert_eq!(hosts, vec!["node-1".to_string(), "node-3".to_string()]);
    }

    #[test]
    fn test_hosts_matching_skips_unlabelled_nodes() {
        let body = json!({
            "items": [{ "metadata": { "name": "bare" } }, node("node-1", "cache-a")]
        });
        let hosts = hosts_matching(&body, "redis", "cache-a").unwrap();
        assert_eq!(hosts, vec!["node-1".to_string()]);
    }

    #[test]
    fn test_hosts_matching_rejects_non_list() {
        let body = json!({ "message": "forbidden" });
        assert!(matches!(
            hosts_matching(&body, "redis", "cache-a"),
            Err(DiscoveryError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new()
            .with_hosts("redis:a", &["node-1", "node-2"])
            .with_hosts("redis:b", &[]);

        let hosts = tokio_test::assert_ok!(resolver.discover("redis:a").await);
        assert_eq!(hosts.len(), 2);
        assert!(matches!(
            resolver.discover("redis:b").await,
            Err(DiscoveryError::NoMatchingNodes(_))
        ));
        assert!(matches!(
            resolver.discover("redis:zzz").await,
            Err(DiscoveryError::NoMatchingNodes(_))
        ));
        assert!(matches!(
            resolver.discover("garbage").await,
            Err(DiscoveryError::InvalidSelector(_))
        ));
    }
}
