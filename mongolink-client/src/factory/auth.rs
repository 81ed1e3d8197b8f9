//! Authenticating decorator over the socket factory.

use std::sync::Arc;

use async_trait::async_trait;
use mongolink_core::wire::{Command, Message};
use mongolink_core::{Error, Result, Version};

use super::socket::SocketConnectionFactory;
use super::{ClusterType, ConnectionFactory};
use crate::callback::FutureCallback;
use crate::config::{ClientConfig, Credentials};
use crate::connection::{Connection, ProxiedConnectionFactory};
use crate::reconnect::{ReconnectStrategy, SimpleReconnectStrategy};
use crate::state::Server;

/// Wraps connection opening with the challenge-response authentication
/// handshake.
///
/// Every connection the inner factory opens is authenticated before it
/// is handed out: a nonce is requested and answered with an MD5 digest
/// of the nonce, the user name, and the password hash. The decorator
/// changes nothing else, so topology factories compose over it exactly
/// as over the raw socket factory.
#[derive(Debug, Clone)]
pub struct AuthenticatingConnectionFactory {
    inner: SocketConnectionFactory,
    config: Arc<ClientConfig>,
}

impl AuthenticatingConnectionFactory {
    /// Wraps the socket factory. The configuration must carry
    /// credentials.
    pub fn new(inner: SocketConnectionFactory, config: Arc<ClientConfig>) -> Self {
        Self { inner, config }
    }

    /// The `user:mongo:password` digest the server stores.
    fn password_hash(credentials: &Credentials) -> String {
        hex::encode(
            *md5::compute(format!(
                "{}:mongo:{}",
                credentials.username(),
                credentials.password()
            )),
        )
    }

    async fn command_round_trip(
        &self,
        connection: &dyn Connection,
        command: Command,
    ) -> Result<mongolink_core::bson::Document> {
        let (callback, receiver) = FutureCallback::new();
        let message: Arc<dyn Message> = Arc::new(command);
        connection.send(message, Some(Box::new(callback))).await?;

        let reply = tokio::time::timeout(self.config.read_timeout(), receiver.recv())
            .await
            .map_err(|_| Error::Timeout("authentication round trip timed out".to_string()))??;
        let reply = reply.verify()?;
        reply
            .documents()
            .first()
            .cloned()
            .ok_or_else(|| Error::Auth("empty authentication reply".to_string()))
    }

    async fn authenticate(&self, connection: &dyn Connection) -> Result<()> {
        let credentials = self
            .config
            .credentials()
            .ok_or_else(|| Error::Auth("no credentials configured".to_string()))?;

        let nonce_reply = self
            .command_round_trip(connection, Command::get_nonce(credentials.database()))
            .await?;
        let nonce = nonce_reply
            .get_str("nonce")
            .ok_or_else(|| Error::Auth("server reply carried no nonce".to_string()))?;

        let key = hex::encode(*md5::compute(format!(
            "{}{}{}",
            nonce,
            credentials.username(),
            Self::password_hash(credentials)
        )));

        self.command_round_trip(
            connection,
            Command::authenticate(
                credentials.database(),
                credentials.username(),
                nonce,
                key,
            ),
        )
        .await
        .map_err(|error| match error {
            Error::Reply(reply_error) => Error::Auth(format!(
                "server rejected credentials for '{}': {reply_error}",
                credentials.username()
            )),
            other => other,
        })?;

        tracing::debug!(
            user = credentials.username(),
            database = credentials.database(),
            "connection authenticated"
        );
        Ok(())
    }
}

#[async_trait]
impl ProxiedConnectionFactory for AuthenticatingConnectionFactory {
    async fn connect_to(&self, server: &Arc<Server>) -> Result<Box<dyn Connection>> {
        let connection = self.inner.connect_to(server).await?;
        if let Err(error) = self.authenticate(connection.as_ref()).await {
            let _ = connection.shutdown(true).await;
            return Err(error);
        }
        Ok(connection)
    }
}

#[async_trait]
impl ConnectionFactory for AuthenticatingConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut last = None;
        for server in self.inner.cluster().servers() {
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
        self.inner.cluster_type()
    }

    fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        // Replacement connections must authenticate too, so the
        // strategy opens them through this decorator.
        Arc::new(SimpleReconnectStrategy::new(
            self.inner.cluster().clone(),
            Arc::new(crate::state::LatencyServerSelector::new(
                self.inner.cluster().clone(),
                false,
            )),
            Arc::new(self.clone()),
            self.config.clone(),
        ))
    }

    fn minimum_server_version(&self) -> Version {
        self.inner.minimum_server_version()
    }

    fn maximum_server_version(&self) -> Version {
        self.inner.maximum_server_version()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_shape() {
        let credentials = Credentials::new("user", "password");
        let hash = AuthenticatingConnectionFactory::password_hash(&credentials);

        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic, and sensitive to both inputs.
        assert_eq!(
            hash,
            AuthenticatingConnectionFactory::password_hash(&Credentials::new(
                "user", "password"
            ))
        );
        assert_ne!(
            hash,
            AuthenticatingConnectionFactory::password_hash(&Credentials::new(
                "user", "other"
            ))
        );
    }
}
