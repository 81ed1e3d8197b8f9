//! Topology-aware connection factories.

mod auth;
mod bootstrap;
mod replica_set;
mod sharded;
mod socket;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use mongolink_core::bson::Document;
use mongolink_core::wire::{Command, Message};
use mongolink_core::{Error, Result, Version};

use crate::callback::FutureCallback;
use crate::config::ClientConfig;
use crate::connection::{Connection, ProxiedConnectionFactory};
use crate::reconnect::ReconnectStrategy;
use crate::state::Server;

pub use auth::AuthenticatingConnectionFactory;
pub use bootstrap::BootstrapConnectionFactory;
pub use replica_set::{ReplicaSetConnection, ReplicaSetConnectionFactory};
pub use sharded::{ShardedConnection, ShardedConnectionFactory};
pub use socket::SocketConnectionFactory;

/// The topology a factory serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterType {
    /// A single plain server process.
    Standalone,
    /// A replica set with one writable primary.
    ReplicaSet,
    /// A router tier fronting a partitioned cluster.
    Sharded,
    /// Topology not (yet) determined.
    Unknown,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterType::Standalone => "standalone",
            ClusterType::ReplicaSet => "replica_set",
            ClusterType::Sharded => "sharded",
            ClusterType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Produces connections appropriate for one cluster topology.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Creates a new connection to the cluster.
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// The topology this factory serves.
    fn cluster_type(&self) -> ClusterType;

    /// The strategy used to replace this factory's broken connections.
    fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy>;

    /// The lowest server version in the cluster.
    fn minimum_server_version(&self) -> Version;

    /// The highest server version in the cluster.
    fn maximum_server_version(&self) -> Version;

    /// Releases the factory's background tasks and pooled connections.
    async fn close(&self);
}

/// Opens a short-lived connection to `server`, issues the identity
/// command, and returns the reply document. Used by every bootstrap
/// path.
pub(crate) async fn probe_identity(
    factory: &Arc<dyn ProxiedConnectionFactory>,
    config: &Arc<ClientConfig>,
    server: &Arc<Server>,
) -> Result<Document> {
    let connection = factory.connect_to(server).await?;

    let (callback, receiver) = FutureCallback::new();
    let message: Arc<dyn Message> = Arc::new(Command::is_master());
    let outcome = async {
        connection.send(message, Some(Box::new(callback))).await?;
        let reply = tokio::time::timeout(config.read_timeout(), receiver.recv())
            .await
            .map_err(|_| {
                Error::Timeout(format!("identity probe of {server} timed out"))
            })??;
        let reply = reply.verify()?;
        reply
            .documents()
            .first()
            .cloned()
            .ok_or_else(|| Error::Protocol("identity reply carried no document".to_string()))
    }
    .await;

    let _ = connection.shutdown(true).await;
    outcome
}
