//! Topology detection and delegation.

use std::sync::Arc;

use async_trait::async_trait;
use mongolink_core::bson::Document;
use mongolink_core::{Error, Result, Version};
use tracing::instrument;

use super::auth::AuthenticatingConnectionFactory;
use super::replica_set::ReplicaSetConnectionFactory;
use super::sharded::ShardedConnectionFactory;
use super::socket::SocketConnectionFactory;
use super::{probe_identity, ClusterType, ConnectionFactory};
use crate::config::ClientConfig;
use crate::connection::{Connection, ProxiedConnectionFactory};
use crate::reconnect::{ReconnectStrategy, SimpleReconnectStrategy};
use crate::state::Cluster;

/// Classifies the cluster by probing a seed and delegates to the
/// matching topology factory.
///
/// The probe's identity reply decides: a router process yields the
/// sharded factory, a replication subdocument yields the replica-set
/// factory, a plain server process yields the socket factory. An
/// unrecognizable reply leaves no delegate and every `connect()` fails.
/// When credentials are configured the underlying socket factory is
/// wrapped so every opened connection runs the authentication
/// handshake first.
#[derive(Debug)]
pub struct BootstrapConnectionFactory {
    config: Arc<ClientConfig>,
    delegate: Option<Box<dyn ConnectionFactory>>,
}

impl BootstrapConnectionFactory {
    /// Probes the configured seeds and builds the matching delegate
    /// factory.
    #[instrument(name = "bootstrap", skip(config))]
    pub async fn bootstrap(config: Arc<ClientConfig>) -> Self {
        let socket = SocketConnectionFactory::new(config.clone());

        let (proxied, standalone): (Arc<dyn ProxiedConnectionFactory>, Box<dyn ConnectionFactory>) =
            if config.credentials().is_some() {
                let authenticating =
                    AuthenticatingConnectionFactory::new(socket, config.clone());
                (
                    Arc::new(authenticating.clone()),
                    Box::new(authenticating),
                )
            } else {
                (Arc::new(socket.clone()), Box::new(socket))
            };

        let probe_cluster = Cluster::new();
        let seeds = config.servers().to_vec();
        for seed in &seeds {
            let server = probe_cluster.add(seed);
            match probe_identity(&proxied, &config, &server).await {
                Ok(document) => {
                    let delegate = Self::delegate_for(&document, proxied, standalone, &config)
                        .await;
                    match &delegate {
                        Some(delegate) => {
                            tracing::info!(
                                seed = %server,
                                cluster_type = %delegate.cluster_type(),
                                "topology classified"
                            );
                        }
                        None => {
                            tracing::warn!(seed = %server, "unrecognizable identity reply");
                        }
                    }
                    return Self { config, delegate };
                }
                Err(error) => {
                    tracing::warn!(seed = %server, %error, "bootstrap probe failed");
                }
            }
        }

        tracing::error!("no seed answered the bootstrap probe");
        Self {
            config,
            delegate: None,
        }
    }

    async fn delegate_for(
        document: &Document,
        proxied: Arc<dyn ProxiedConnectionFactory>,
        standalone: Box<dyn ConnectionFactory>,
        config: &Arc<ClientConfig>,
    ) -> Option<Box<dyn ConnectionFactory>> {
        if document.get_str("process") == Some("mongos")
            || document.get_str("msg") == Some("isdbgrid")
        {
            return Some(Box::new(
                ShardedConnectionFactory::bootstrap(proxied, config.clone()).await,
            ));
        }

        let replicated = document
            .get_document("repl")
            .map(|repl| repl.contains("hosts") || repl.contains("primary"))
            .unwrap_or(false)
            || document.contains("setName")
            || document.contains("hosts");
        if replicated {
            return Some(Box::new(
                ReplicaSetConnectionFactory::bootstrap(proxied, config.clone()).await,
            ));
        }

        if document.get_str("process") == Some("mongod") || document.contains("ismaster") {
            return Some(standalone);
        }

        None
    }

    /// Returns the detected cluster type, or `Unknown` when no seed
    /// answered recognizably.
    pub fn detected_cluster_type(&self) -> ClusterType {
        self.delegate
            .as_ref()
            .map(|delegate| delegate.cluster_type())
            .unwrap_or(ClusterType::Unknown)
    }
}

#[async_trait]
impl ConnectionFactory for BootstrapConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        match &self.delegate {
            Some(delegate) => delegate.connect().await,
            None => Err(Error::Io(
                "bootstrap could not classify the cluster; no delegate factory".to_string(),
            )),
        }
    }

    fn cluster_type(&self) -> ClusterType {
        self.detected_cluster_type()
    }

    fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        match &self.delegate {
            Some(delegate) => delegate.reconnect_strategy(),
            None => {
                // No topology, no better plan than the simple walk over
                // the configured seeds.
                let socket = SocketConnectionFactory::new(self.config.clone());
                socket.reconnect_strategy()
            }
        }
    }

    fn minimum_server_version(&self) -> Version {
        self.delegate
            .as_ref()
            .map(|delegate| delegate.minimum_server_version())
            .unwrap_or_else(Version::unknown)
    }

    fn maximum_server_version(&self) -> Version {
        self.delegate
            .as_ref()
            .map(|delegate| delegate.maximum_server_version())
            .unwrap_or_else(Version::unknown)
    }

    async fn close(&self) {
        if let Some(delegate) = &self.delegate {
            delegate.close().await;
        }
    }
}
