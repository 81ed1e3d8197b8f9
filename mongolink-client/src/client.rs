//! The client surface consumed by the collection and cursor layers.

use std::sync::Arc;
use std::time::Duration;

use mongolink_core::wire::Message;
use mongolink_core::{ReadPreference, Result};
use tracing::instrument;

use crate::callback::ReplyCallback;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::durability::Durability;
use crate::factory::{BootstrapConnectionFactory, ClusterType, ConnectionFactory};

/// A handle to the cluster.
///
/// The client keeps one current connection produced by its factory,
/// replacing it through the factory's reconnect strategy when it
/// breaks. Clones share the connection and the factory.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: Arc<ClientConfig>,
    factory: Box<dyn ConnectionFactory>,
    connection: tokio::sync::Mutex<Option<Arc<dyn Connection>>>,
}

impl Client {
    /// Bootstraps the topology from the configured seeds and returns a
    /// ready client.
    #[instrument(name = "client.connect", skip(config))]
    pub async fn connect(config: ClientConfig) -> Result<Client> {
        let config = Arc::new(config);
        let factory = BootstrapConnectionFactory::bootstrap(config.clone()).await;
        Ok(Self::with_factory(config, Box::new(factory)))
    }

    /// Builds a client over an explicit factory.
    pub fn with_factory(config: Arc<ClientConfig>, factory: Box<dyn ConnectionFactory>) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config,
                factory,
                connection: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Sends one message. The reply callback, when given, is completed
    /// exactly once with the reply or an error. Returns the canonical
    /// name of the server that accepted the message.
    pub async fn send(
        &self,
        message: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        let connection = self.acquire().await?;
        connection.send(message, callback).await
    }

    /// Sends two linked messages, e.g. a write and its get-last-error.
    /// The callback attaches to the second message.
    pub async fn send_pair(
        &self,
        first: Arc<dyn Message>,
        second: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        let connection = self.acquire().await?;
        connection.send_pair(first, second, callback).await
    }

    /// Returns the default durability for writes.
    pub fn default_durability(&self) -> &Durability {
        self.inner.config.default_durability()
    }

    /// Returns the default read preference.
    pub fn default_read_preference(&self) -> &ReadPreference {
        self.inner.config.default_read_preference()
    }

    /// Returns the detected cluster topology.
    pub fn cluster_type(&self) -> ClusterType {
        self.inner.factory.cluster_type()
    }

    /// Returns the client's configuration.
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.inner.config
    }

    /// Returns a view that pins all requests to one connection,
    /// restoring total order across them.
    pub fn serialized(&self) -> SerializedClient {
        SerializedClient {
            client: self.clone(),
            pinned: tokio::sync::Mutex::new(None),
        }
    }

    /// Drains and closes the current connection and releases the
    /// factory.
    pub async fn close(&self) {
        let connection = self.inner.connection.lock().await.take();
        if let Some(connection) = connection {
            let _ = connection.shutdown(false).await;
            connection.wait_closed(Duration::from_secs(5)).await;
            let _ = connection.shutdown(true).await;
        }
        self.inner.factory.close().await;
    }

    /// Returns the connection currently in use, if one is open. Mostly
    /// useful for diagnostics.
    pub async fn current_connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.connection.lock().await.clone()
    }

    /// Returns a healthy connection, opening or repairing one as
    /// needed.
    pub(crate) async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        let mut guard = self.inner.connection.lock().await;

        if let Some(connection) = guard.as_ref() {
            if connection.is_available() {
                return Ok(connection.clone());
            }

            // The connection broke; let the topology's strategy find a
            // replacement before falling back to a fresh connect.
            let broken = connection.clone();
            let strategy = self.inner.factory.reconnect_strategy();
            if let Some(replacement) = strategy.reconnect(broken.as_ref()).await {
                let replacement: Arc<dyn Connection> = Arc::from(replacement);
                *guard = Some(replacement.clone());
                return Ok(replacement);
            }
            *guard = None;
        }

        let connection: Arc<dyn Connection> = Arc::from(self.inner.factory.connect().await?);
        *guard = Some(connection.clone());
        Ok(connection)
    }
}

/// A client view that routes every request over a single pinned
/// connection, restoring total order for callers that need it.
#[derive(Debug)]
pub struct SerializedClient {
    client: Client,
    pinned: tokio::sync::Mutex<Option<Arc<dyn Connection>>>,
}

impl SerializedClient {
    async fn pinned_connection(&self) -> Result<Arc<dyn Connection>> {
        let mut guard = self.pinned.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.is_available() {
                return Ok(connection.clone());
            }
        }
        let connection = self.client.acquire().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Sends one message over the pinned connection.
    pub async fn send(
        &self,
        message: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        self.pinned_connection().await?.send(message, callback).await
    }

    /// Sends two linked messages over the pinned connection.
    pub async fn send_pair(
        &self,
        first: Arc<dyn Message>,
        second: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        self.pinned_connection()
            .await?
            .send_pair(first, second, callback)
            .await
    }

    /// Returns the default durability for writes.
    pub fn default_durability(&self) -> &Durability {
        self.client.default_durability()
    }

    /// Returns the default read preference.
    pub fn default_read_preference(&self) -> &ReadPreference {
        self.client.default_read_preference()
    }

    /// Returns the detected cluster topology.
    pub fn cluster_type(&self) -> ClusterType {
        self.client.cluster_type()
    }
}
