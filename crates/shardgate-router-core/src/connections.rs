//! Shard connection manager
//!
//! Owns one backend per admitted shard together with the hash ring. A shard
//! is put on the ring only after its backend answered a ping, and both maps
//! change under the same write lock, so every name `resolve` returns has a
//! connection behind it.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use shardgate_core::{Backend, Connector, GatewayConfig, MembershipResolver, ShardConfig};

use crate::error::RouterError;
use crate::ring::HashRing;
use crate::types::ShardName;

/// Outcome of admitting every configured shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    pub admitted: Vec<ShardName>,
    /// Shard name and the reason it was skipped
    pub failed: Vec<(ShardName, String)>,
}

/// Ring plus per-shard backends
pub struct ShardConnections {
    ring: HashRing,
    backends: RwLock<HashMap<ShardName, Arc<dyn Backend>>>,
}

impl ShardConnections {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            ring: HashRing::with_virtual_nodes(virtual_nodes),
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Register an already-connected backend under `name`.
    ///
    /// Returns `false` and keeps the existing backend if `name` is already
    /// registered.
    pub fn insert(&self, name: &str, backend: Arc<dyn Backend>) -> bool {
        let mut backends = self.backends.write();
        if backends.contains_key(name) || self.ring.contains(name) {
            return false;
        }
        backends.insert(name.to_string(), backend);
        self.ring.add_shard(name)
    }

    /// Connect `name` over its discovered hosts and put it on the ring.
    ///
    /// On failure nothing is registered.
    pub async fn admit_shard(
        &self,
        name: &str,
        config: &ShardConfig,
        hosts: &[String],
        connector: &dyn Connector,
    ) -> Result<(), RouterError> {
        if self.ring.contains(name) {
            return Err(RouterError::ShardAlreadyAdmitted(name.to_string()));
        }
        let addrs: Vec<String> = hosts
            .iter()
            .map(|host| format!("{}:{}", host, config.port))
            .collect();

        let backend = connector
            .connect(name, config, &addrs)
            .await
            .map_err(|source| RouterError::Backend {
                shard: name.to_string(),
                source,
            })?;

        // A concurrent admission of the same name may have won the race
        if !self.insert(name, backend) {
            return Err(RouterError::ShardAlreadyAdmitted(name.to_string()));
        }
        info!(shard = %name, hosts = ?addrs, "Shard admitted");
        Ok(())
    }

    /// Discover and admit every configured shard.
    ///
    /// Shards are admitted independently; a failing shard is logged and
    /// skipped. Fails only if no shard made it onto the ring.
    pub async fn admit_all(
        &self,
        config: &GatewayConfig,
        resolver: &dyn MembershipResolver,
        connector: &dyn Connector,
    ) -> Result<AdmissionReport, RouterError> {
        let attempts = config.shards.iter().map(|(name, shard)| async move {
            let result = match resolver.discover(&shard.node_label).await {
                Ok(hosts) => self.admit_shard(name, shard, &hosts, connector).await,
                Err(source) => Err(RouterError::Discovery {
                    shard: name.clone(),
                    source,
                }),
            };
            (name.clone(), result)
        });

        let mut report = AdmissionReport::default();
        for (name, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.admitted.push(name),
                Err(err) => {
                    warn!(shard = %name, error = %err, "Shard skipped");
                    report.failed.push((name, err.to_string()));
                }
            }
        }

        if report.admitted.is_empty() {
            return Err(RouterError::NoShardsAdmitted);
        }
        info!(
            admitted = report.admitted.len(),
            failed = report.failed.len(),
            "Shard admission finished"
        );
        Ok(report)
    }

    /// Backend of an admitted shard
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, RouterError> {
        match self.backends.read().get(name) {
            Some(backend) => Ok(Arc::clone(backend)),
            None => {
                error!(shard = %name, "Ring and connection map disagree");
                Err(RouterError::ShardNotConnected(name.to_string()))
            }
        }
    }

    /// Resolve `key` and borrow the owning shard's backend
    pub fn route(&self, key: &str) -> Result<(ShardName, Arc<dyn Backend>), RouterError> {
        let shard = self.ring.resolve(key)?;
        let backend = self.get(&shard)?;
        Ok((shard, backend))
    }

    /// Take a shard off the ring and drop its connection.
    ///
    /// Keys it owned are routed to its ring successors from now on; their
    /// data is not moved.
    pub fn remove_shard(&self, name: &str) -> bool {
        let mut backends = self.backends.write();
        let on_ring = self.ring.remove_shard(name);
        let connected = backends.remove(name).is_some();
        if on_ring || connected {
            info!(shard = %name, "Shard removed");
        }
        on_ring || connected
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// Admitted shard names, sorted
    pub fn shard_names(&self) -> Vec<ShardName> {
        self.ring.shards()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgate_core::{MemoryBackend, MemoryConnector, StaticResolver};

    fn shard(label: &str) -> ShardConfig {
        ShardConfig {
            node_label: label.to_string(),
            failover_group: "mymaster".to_string(),
            port: 26379,
            password: String::new(),
            database: 0,
        }
    }

    fn config_with(shards: &[(&str, &str)]) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        for (name, label) in shards {
            config.shards.insert(name.to_string(), shard(label));
        }
        config
    }

    #[tokio::test]
    async fn test_admit_all_skips_undiscoverable_shard() {
        let config = config_with(&[("A", "redis:a"), ("B", "redis:b")]);
        let resolver = StaticResolver::new()
            .with_hosts("redis:a", &["node-1", "node-2"])
            .with_hosts("redis:b", &[]);
        let connector = MemoryConnector::new();
        let connections = ShardConnections::new(40);

        let report = connections
            .admit_all(&config, &resolver, &connector)
            .await
            .unwrap();

        assert_eq!(report.admitted, vec!["A".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "B");
        assert_eq!(connections.shard_names(), vec!["A".to_string()]);

        // Every key lands on the surviving shard
        for i in 0..200 {
            let (name, _) = connections.route(&format!("key:{}", i)).unwrap();
            assert_eq!(name, "A");
        }
    }

    #[tokio::test]
    async fn test_admit_all_skips_unreachable_shard() {
        let config = config_with(&[("A", "redis:a"), ("B", "redis:b")]);
        let resolver = StaticResolver::new()
            .with_hosts("redis:a", &["node-1"])
            .with_hosts("redis:b", &["node-2"]);
        let connector = MemoryConnector::new();
        connector.refuse("B");
        let connections = ShardConnections::new(40);

        let report = connections
            .admit_all(&config, &resolver, &connector)
            .await
            .unwrap();

        assert_eq!(report.admitted, vec!["A".to_string()]);
        assert!(!connections.ring().contains("B"));
        assert!(matches!(connections.get("B"), Err(RouterError::ShardNotConnected(_))));
    }

    #[tokio::test]
    async fn test_admit_all_fails_when_nothing_admitted() {
        let config = config_with(&[("A", "redis:a"), ("B", "redis:b")]);
        let resolver = StaticResolver::new();
        let connector = MemoryConnector::new();
        let connections = ShardConnections::new(40);

        let result = connections.admit_all(&config, &resolver, &connector).await;
        assert!(matches!(result, Err(RouterError::NoShardsAdmitted)));
        assert!(matches!(connections.route("k"), Err(RouterError::EmptyRing)));
    }

    #[tokio::test]
    async fn test_admit_shard_appends_port() {
        let connector = MemoryConnector::new();
        let connections = ShardConnections::new(10);
        let hosts = vec!["node-1".to_string()];

        tokio_test::assert_ok!(
            connections
                .admit_shard("A", &shard("redis:a"), &hosts, &connector)
                .await
        );
        assert!(connector.backend("A").is_some());
        assert_eq!(connections.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_admission_leaves_ring_untouched() {
        let connector = MemoryConnector::new();
        connector.refuse("A");
        let connections = ShardConnections::new(10);
        let hosts = vec!["node-1".to_string()];

        let result = connections
            .admit_shard("A", &shard("redis:a"), &hosts, &connector)
            .await;
        assert!(matches!(result, Err(RouterError::Backend { .. })));
        assert!(connections.is_empty());
    }

    #[test]
    fn test_insert_keeps_existing_backend() {
        let connections = ShardConnections::new(10);
        assert!(connections.insert("A", Arc::new(MemoryBackend::new("first"))));
        assert!(!connections.insert("A", Arc::new(MemoryBackend::new("second"))));

        assert!(connections.get("A").unwrap().describe().contains("first"));
        assert_eq!(connections.ring().points().len(), 10);

        // Explicit removal allows re-adding
        assert!(connections.remove_shard("A"));
        assert!(connections.insert("A", Arc::new(MemoryBackend::new("second"))));
        assert!(connections.get("A").unwrap().describe().contains("second"));
    }

    #[tokio::test]
    async fn test_admit_shard_twice_is_rejected() {
        let connector = MemoryConnector::new();
        let connections = ShardConnections::new(10);
        let hosts = vec!["node-1".to_string()];

        tokio_test::assert_ok!(
            connections
                .admit_shard("A", &shard("redis:a"), &hosts, &connector)
                .await
        );
        let again = connections
            .admit_shard("A", &shard("redis:a"), &hosts, &connector)
            .await;
        assert!(matches!(again, Err(RouterError::ShardAlreadyAdmitted(_))));
        assert_eq!(connections.len(), 1);
    }

    #[test]
    fn test_remove_shard() {
        let connections = ShardConnections::new(10);
        connections.insert("A", Arc::new(MemoryBackend::new("A")));
        connections.insert("B", Arc::new(MemoryBackend::new("B")));

        assert!(connections.remove_shard("B"));
        assert!(!connections.remove_shard("B"));
        assert_eq!(connections.shard_names(), vec!["A".to_string()]);
        assert!(matches!(connections.get("B"), Err(RouterError::ShardNotConnected(_))));
    }
}
