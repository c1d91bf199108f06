//! Shardgate gateway - REST front end over sharded cache backends
//!
//! The gateway is responsible for:
//! - Admitting the configured shards at startup
//! - Routing every key to its owning shard
//! - Translating REST calls into backend commands
//! - Answering with a uniform JSON envelope

pub mod dispatcher;
pub mod envelope;
pub mod http;
pub mod operation;
pub mod params;

pub use dispatcher::Dispatcher;
pub use envelope::{Envelope, Value};
pub use operation::{Category, Operation};
pub use params::{ParamError, Params};

use anyhow::Context;
use shardgate_core::{Connector, GatewayConfig, MembershipResolver};
use shardgate_router_core::{AdmissionReport, RouterError, ShardConnections};
use std::sync::Arc;
use tracing::info;

/// Gateway node
pub struct Gateway {
    config: GatewayConfig,
    dispatcher: Arc<Dispatcher>,
    report: AdmissionReport,
}

impl Gateway {
    /// Admit the configured shards and build the dispatcher.
    ///
    /// Fails only when no shard could be admitted.
    pub async fn start(
        config: GatewayConfig,
        resolver: &dyn MembershipResolver,
        connector: &dyn Connector,
    ) -> Result<Self, RouterError> {
        info!(
            instance_id = %config.instance_id,
            title = %config.title,
            shards = config.shards.len(),
            "Starting gateway"
        );

        let connections = Arc::new(ShardConnections::new(config.virtual_nodes));
        let report = connections.admit_all(&config, resolver, connector).await?;

        Ok(Self {
            config,
            dispatcher: Arc::new(Dispatcher::new(connections)),
            report,
        })
    }

    /// Serve HTTP until ctrl-c
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;

        info!(
            instance_id = %self.config.instance_id,
            listen_addr = %self.config.listen_addr,
            shards = ?self.dispatcher.connections().shard_names(),
            "Gateway started"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")?;

        info!("Gateway stopped");
        Ok(())
    }

    pub fn router(&self) -> axum::Router {
        http::router(Arc::clone(&self.dispatcher))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connections(&self) -> &Arc<ShardConnections> {
        self.dispatcher.connections()
    }

    /// Which shards were admitted or skipped at startup
    pub fn admission(&self) -> &AdmissionReport {
        &self.report
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler; run until the process is killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
