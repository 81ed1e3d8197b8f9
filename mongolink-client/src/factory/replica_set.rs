//! Replica-set topology: primary-routed writes, preference-routed
//! reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongolink_core::wire::Message;
use mongolink_core::{Error, Result, Version};
use tracing::instrument;

use super::{probe_identity, ClusterType, ConnectionFactory};
use crate::callback::ReplyCallback;
use crate::config::ClientConfig;
use crate::connection::{Connection, ProxiedConnectionFactory};
use crate::reconnect::{ReconnectStrategy, ReplicaSetReconnectStrategy};
use crate::state::{
    Cluster, ClusterPinger, LatencyServerSelector, ReadPreferenceSelector, Server, ServerRole,
    ServerSelector,
};

/// Lazily opened connections to secondaries, shared between the factory
/// and every [`ReplicaSetConnection`] it hands out.
///
/// The pool owns the secondary connections; replica-set connections
/// only borrow them for the duration of a send.
#[derive(Debug, Default)]
struct SecondaryPool {
    connections: tokio::sync::Mutex<HashMap<String, Arc<dyn Connection>>>,
}

impl SecondaryPool {
    async fn acquire(
        &self,
        server: &Arc<Server>,
        factory: &Arc<dyn ProxiedConnectionFactory>,
    ) -> Result<Arc<dyn Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(server.canonical_name()) {
            if existing.is_available() {
                return Ok(existing.clone());
            }
            connections.remove(server.canonical_name());
        }

        let connection: Arc<dyn Connection> = Arc::from(factory.connect_to(server).await?);
        connections.insert(server.canonical_name().to_string(), connection.clone());
        Ok(connection)
    }

    async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        for (_, connection) in connections.drain() {
            let _ = connection.shutdown(true).await;
        }
    }
}

/// Bootstraps and serves a replica set.
///
/// Seeds are contacted in turn with the identity command; the first
/// reply yields the primary and the member list, every member is
/// registered in the cluster, and the pinger keeps their health
/// current.
#[derive(Debug)]
pub struct ReplicaSetConnectionFactory {
    factory: Arc<dyn ProxiedConnectionFactory>,
    config: Arc<ClientConfig>,
    cluster: Arc<Cluster>,
    selector: Arc<dyn ServerSelector>,
    pinger: Arc<ClusterPinger>,
    secondaries: Arc<SecondaryPool>,
}

impl ReplicaSetConnectionFactory {
    /// Discovers the replica set through the configured seeds and
    /// starts ongoing health probing.
    #[instrument(name = "replica_set.bootstrap", skip(factory, config))]
    pub async fn bootstrap(
        factory: Arc<dyn ProxiedConnectionFactory>,
        config: Arc<ClientConfig>,
    ) -> Self {
        let cluster = Arc::new(Cluster::new());
        for seed in config.servers() {
            cluster.add(seed);
        }

        for seed in config.servers() {
            let server = cluster.add(seed);
            match probe_identity(&factory, &config, &server).await {
                Ok(document) => {
                    server.update_from(&document);

                    if config.auto_discover_servers() {
                        for member in Server::discovered_members(&document) {
                            cluster.add(&member);
                        }
                    }

                    let identity = document.get_document("repl").unwrap_or(&document);
                    if let Some(primary) = identity.get_str("primary") {
                        cluster.add(primary).set_role(ServerRole::Writable);
                    }

                    tracing::info!(
                        seed = %server,
                        members = cluster.servers().len(),
                        "replica set discovered"
                    );
                    break;
                }
                Err(error) => {
                    tracing::warn!(seed = %server, %error, "replica set seed unreachable");
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
            Arc::new(LatencyServerSelector::new(cluster.clone(), true));

        Self {
            factory,
            config,
            cluster,
            selector,
            pinger,
            secondaries: Arc::new(SecondaryPool::default()),
        }
    }

    /// Returns the cluster state this factory maintains.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

#[async_trait]
impl ConnectionFactory for ReplicaSetConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut last = None;
        for server in self.cluster.writable_servers() {
            match self.factory.connect_to(&server).await {
                Ok(primary) => {
                    return Ok(Box::new(ReplicaSetConnection {
                        primary,
                        primary_server: server,
                        cluster: self.cluster.clone(),
                        config: self.config.clone(),
                        factory: self.factory.clone(),
                        secondaries: self.secondaries.clone(),
                    }));
                }
                Err(error) => {
                    tracing::debug!(server = %server, %error, "primary connection failed");
                    last = Some(error);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::Io("replica set has no writable server".to_string())
        }))
    }

    fn cluster_type(&self) -> ClusterType {
        ClusterType::ReplicaSet
    }

    fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        Arc::new(ReplicaSetReconnectStrategy::new(
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
        self.secondaries.close_all().await;
    }
}

/// A connection view over a replica set: writes and primary reads ride
/// the owned primary connection; reads whose preference admits
/// secondaries are routed through the factory's pool.
#[derive(Debug)]
pub struct ReplicaSetConnection {
    primary: Box<dyn Connection>,
    primary_server: Arc<Server>,
    cluster: Arc<Cluster>,
    config: Arc<ClientConfig>,
    factory: Arc<dyn ProxiedConnectionFactory>,
    secondaries: Arc<SecondaryPool>,
}

impl ReplicaSetConnection {
    async fn route(
        &self,
        message: &Arc<dyn Message>,
    ) -> Result<Option<Arc<dyn Connection>>> {
        let Some(preference) = message.read_preference() else {
            return Ok(None);
        };
        if !preference.allows_secondary() {
            return Ok(None);
        }

        let selector =
            ReadPreferenceSelector::new(self.cluster.clone(), preference.clone());
        let mut last = None;
        for candidate in selector.pick_servers() {
            if candidate.canonical_name() == self.primary_server.canonical_name() {
                // The primary's own connection serves this candidate.
                return Ok(None);
            }
            match self.secondaries.acquire(&candidate, &self.factory).await {
                Ok(connection) => return Ok(Some(connection)),
                Err(error) => {
                    tracing::debug!(server = %candidate, %error, "secondary unavailable");
                    last = Some(error);
                }
            }
        }

        if preference.mode().allows_primary() {
            return Ok(None);
        }
        Err(last.unwrap_or_else(|| {
            Error::Io("no secondary matches the read preference".to_string())
        }))
    }
}

#[async_trait]
impl Connection for ReplicaSetConnection {
    async fn send(
        &self,
        message: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        match self.route(&message).await? {
            Some(secondary) => secondary.send(message, callback).await,
            None => self.primary.send(message, callback).await,
        }
    }

    async fn send_pair(
        &self,
        first: Arc<dyn Message>,
        second: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        // Linked pairs are write idioms; they stay on the primary.
        self.primary.send_pair(first, second, callback).await
    }

    async fn flush(&self) -> Result<()> {
        self.primary.flush().await
    }

    async fn shutdown(&self, force: bool) -> Result<()> {
        // Secondaries belong to the factory's pool and stay up for
        // other connections.
        self.primary.shutdown(force).await
    }

    fn is_available(&self) -> bool {
        self.primary.is_available()
    }

    fn is_idle(&self) -> bool {
        self.primary.is_idle()
    }

    fn is_open(&self) -> bool {
        self.primary.is_open()
    }

    fn is_shutting_down(&self) -> bool {
        self.primary.is_shutting_down()
    }

    fn pending_count(&self) -> usize {
        self.primary.pending_count()
    }

    fn server_name(&self) -> String {
        self.primary.server_name()
    }

    async fn wait_closed(&self, timeout: Duration) {
        self.primary.wait_closed(timeout).await
    }
}
