//! Sharded topology: latency-balanced connections to the router tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongolink_core::bson::Document;
use mongolink_core::wire::{Message, Query};
use mongolink_core::{Error, Result, Version};
use tracing::instrument;

use super::{ClusterType, ConnectionFactory};
use crate::callback::{FutureCallback, ReplyCallback};
use crate::config::ClientConfig;
use crate::connection::{Connection, ProxiedConnection, ProxiedConnectionFactory};
use crate::reconnect::{ReconnectStrategy, SimpleReconnectStrategy};
use crate::state::{Cluster, ClusterPinger, LatencyServerSelector, Server, ServerSelector};

/// Database holding the router registry.
const ROUTER_REGISTRY_DATABASE: &str = "config";
/// Collection listing the router processes, keyed by `host:port`.
const ROUTER_REGISTRY_COLLECTION: &str = "mongos";

/// Bootstraps and serves a partitioned cluster's router tier.
///
/// A seed router is queried for the registry of all routers; each is
/// registered in the cluster and pinged for latency, and every new
/// connection goes to the lowest-latency router.
#[derive(Debug)]
pub struct ShardedConnectionFactory {
    factory: Arc<dyn ProxiedConnectionFactory>,
    config: Arc<ClientConfig>,
    cluster: Arc<Cluster>,
    selector: Arc<dyn ServerSelector>,
    pinger: Arc<ClusterPinger>,
}

impl ShardedConnectionFactory {
    /// Discovers the router tier through the configured seeds and
    /// starts ongoing health probing.
    #[instrument(name = "sharded.bootstrap", skip(factory, config))]
    pub async fn bootstrap(
        factory: Arc<dyn ProxiedConnectionFactory>,
        config: Arc<ClientConfig>,
    ) -> Self {
        let cluster = Arc::new(Cluster::new());
        for seed in config.servers() {
            cluster.add(seed);
        }

        if config.auto_discover_servers() {
            for seed in config.servers() {
                let server = cluster.add(seed);
                match Self::find_routers(&factory, &config, &server, &cluster).await {
                    Ok(found) => {
                        tracing::info!(seed = %server, routers = found, "router tier discovered");
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(seed = %server, %error, "router registry query failed");
                    }
                }
            }
        }

        let pinger = Arc::new(ClusterPinger::new(
            cluster.clone(),
            factory.clone(),
            config.clone(),
        ));
        pinger.initial_sweep().await;
        pinger.start();

        let selector: Arc<dyn ServerSelector> =
            Arc::new(LatencyServerSelector::new(cluster.clone(), false));

        Self {
            factory,
            config,
            cluster,
            selector,
            pinger,
        }
    }

    /// Queries the seed's router registry and registers every listed
    /// router. Returns the number of routers found.
    async fn find_routers(
        factory: &Arc<dyn ProxiedConnectionFactory>,
        config: &Arc<ClientConfig>,
        seed: &Arc<Server>,
        cluster: &Arc<Cluster>,
    ) -> Result<usize> {
        let connection = factory.connect_to(seed).await?;

        let (callback, receiver) = FutureCallback::new();
        let query: Arc<dyn Message> = Arc::new(Query::new(
            ROUTER_REGISTRY_DATABASE,
            ROUTER_REGISTRY_COLLECTION,
            Document::new(),
        ));

        let outcome = async {
            connection.send(query, Some(Box::new(callback))).await?;
            let reply = tokio::time::timeout(config.read_timeout(), receiver.recv())
                .await
                .map_err(|_| Error::Timeout("router registry query timed out".to_string()))??;
            let reply = reply.verify()?;

            let mut found = 0;
            for document in reply.documents() {
                if let Some(name) = document.get_str("_id") {
                    cluster.add(name);
                    found += 1;
                    tracing::debug!(router = name, "registered router");
                }
            }
            Ok(found)
        }
        .await;

        let _ = connection.shutdown(true).await;
        outcome
    }

    /// Returns the cluster state this factory maintains.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

#[async_trait]
impl ConnectionFactory for ShardedConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut last = None;
        for server in self.selector.pick_servers() {
            match self.factory.connect_to(&server).await {
                Ok(connection) => {
                    return Ok(Box::new(ShardedConnection::new(connection, server)));
                }
                Err(error) => {
                    tracing::debug!(server = %server, %error, "router connection failed");
                    last = Some(error);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::Io("could not determine a router to connect to".to_string())
        }))
    }

    fn cluster_type(&self) -> ClusterType {
        ClusterType::Sharded
    }

    fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        Arc::new(SimpleReconnectStrategy::new(
            self.cluster.clone(),
            self.selector.clone(),
            self.factory.clone(),
            self.config.clone(),
        ))
    }

    fn minimum_server_version(&self) -> Version {
        self.cluster.minimum_server_version()
    }

    fn maximum_server_version(&self) -> Version {
        self.cluster.maximum_server_version()
    }

    async fn close(&self) {
        self.pinger.stop();
    }
}

/// A connection to one router of the tier.
///
/// Routers are interchangeable, so this is a thin decoration over the
/// socket connection that keeps hold of the router's server entry for
/// diagnostics.
#[derive(Debug)]
pub struct ShardedConnection {
    inner: ProxiedConnection,
    server: Arc<Server>,
}

impl ShardedConnection {
    fn new(connection: Box<dyn Connection>, server: Arc<Server>) -> Self {
        Self {
            inner: ProxiedConnection::new(connection),
            server,
        }
    }

    /// Returns the router this connection is pinned to.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

#[async_trait]
impl Connection for ShardedConnection {
    async fn send(
        &self,
        message: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        self.inner.send(message, callback).await
    }

    async fn send_pair(
        &self,
        first: Arc<dyn Message>,
        second: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        self.inner.send_pair(first, second, callback).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn shutdown(&self, force: bool) -> Result<()> {
        self.inner.shutdown(force).await
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }

    fn server_name(&self) -> String {
        self.inner.server_name()
    }

    async fn wait_closed(&self, timeout: Duration) {
        self.inner.wait_closed(timeout).await
    }
}
