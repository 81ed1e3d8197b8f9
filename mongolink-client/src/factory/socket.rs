//! The default factory: one raw socket connection per call.

use std::sync::Arc;

use async_trait::async_trait;
use mongolink_core::{Error, Result, Version};

use super::{ClusterType, ConnectionFactory};
use crate::config::ClientConfig;
use crate::connection::{Connection, ProxiedConnectionFactory, SocketConnection};
use crate::reconnect::{ReconnectStrategy, SimpleReconnectStrategy};
use crate::state::{Cluster, LatencyServerSelector, Server, ServerSelector};

/// Opens raw [`SocketConnection`]s, one per call.
///
/// Serves a standalone server directly and acts as the proxied base
/// factory every topology factory (and the authenticating wrapper)
/// builds on. Clones share the cluster view.
#[derive(Debug, Clone)]
pub struct SocketConnectionFactory {
    config: Arc<ClientConfig>,
    cluster: Arc<Cluster>,
    selector: Arc<dyn ServerSelector>,
}

impl SocketConnectionFactory {
    /// Creates the factory, seeding the cluster from the configuration.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        let cluster = Arc::new(Cluster::new());
        for server in config.servers() {
            cluster.add(server);
        }
        let selector: Arc<dyn ServerSelector> =
            Arc::new(LatencyServerSelector::new(cluster.clone(), false));
        Self {
            config,
            cluster,
            selector,
        }
    }

    /// Returns the cluster this factory tracks.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Returns the factory's configuration.
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for SocketConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut last = None;
        for server in self.selector.pick_servers() {
            match self.connect_to(&server).await {
                Ok(connection) => return Ok(connection),
                Err(error) => last = Some(error),
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::Io("could not determine a server to connect to".to_string())
        }))
    }

    fn cluster_type(&self) -> ClusterType {
        ClusterType::Standalone
    }

    fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        Arc::new(SimpleReconnectStrategy::new(
            self.cluster.clone(),
            self.selector.clone(),
            Arc::new(self.clone()),
            self.config.clone(),
        ))
    }

    fn minimum_server_version(&self) -> Version {
        self.cluster.minimum_server_version()
    }

    fn maximum_server_version(&self) -> Version {
        self.cluster.maximum_server_version()
    }

    async fn close(&self) {}
}

#[async_trait]
impl ProxiedConnectionFactory for SocketConnectionFactory {
    async fn connect_to(&self, server: &Arc<Server>) -> Result<Box<dyn Connection>> {
        let connection =
            SocketConnection::connect(server.clone(), self.config.clone()).await?;
        Ok(Box::new(connection))
    }
}
