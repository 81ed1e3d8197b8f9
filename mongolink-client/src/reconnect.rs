//! Strategies for restoring service after a connection failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mongolink_core::wire::{Command, Message};
use mongolink_core::{Error, Result};
use rand::Rng;

use crate::callback::FutureCallback;
use crate::config::ClientConfig;
use crate::connection::{Connection, ProxiedConnectionFactory};
use crate::state::{Cluster, Server, ServerRole, ServerSelector};

/// Base pause between replica-set quorum rounds; jittered so members of
/// a partitioned client fleet do not probe in lock step.
const QUORUM_ROUND_PAUSE: Duration = Duration::from_millis(100);

/// Replaces a broken connection with a working one, or reports that the
/// cluster is unusable by returning `None`.
///
/// Strategies catch connection errors internally and propagate only the
/// final verdict.
#[async_trait]
pub trait ReconnectStrategy: Send + Sync + fmt::Debug {
    /// Attempts to replace `old_connection`.
    async fn reconnect(&self, old_connection: &dyn Connection) -> Option<Box<dyn Connection>>;
}

async fn ping(connection: &dyn Connection, config: &ClientConfig) -> Result<()> {
    let (callback, receiver) = FutureCallback::new();
    let message: Arc<dyn Message> = Arc::new(Command::server_status());
    connection.send(message, Some(Box::new(callback))).await?;

    let reply = tokio::time::timeout(config.read_timeout(), receiver.recv())
        .await
        .map_err(|_| Error::Timeout("status ping timed out".to_string()))??;
    reply.verify()?;
    Ok(())
}

/// Reconnects to the same server first, then walks the selector's
/// candidates; each freshly opened connection must answer a status ping
/// before it is accepted.
pub struct SimpleReconnectStrategy {
    cluster: Arc<Cluster>,
    selector: Arc<dyn ServerSelector>,
    factory: Arc<dyn ProxiedConnectionFactory>,
    config: Arc<ClientConfig>,
}

impl SimpleReconnectStrategy {
    /// Creates the strategy over a factory's cluster view.
    pub fn new(
        cluster: Arc<Cluster>,
        selector: Arc<dyn ServerSelector>,
        factory: Arc<dyn ProxiedConnectionFactory>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            cluster,
            selector,
            factory,
            config,
        }
    }

    /// Returns the cluster state the strategy consults.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Returns the selector ordering fail-over candidates.
    pub fn selector(&self) -> &Arc<dyn ServerSelector> {
        &self.selector
    }

    /// Returns the factory used to open replacement connections.
    pub fn connection_factory(&self) -> &Arc<dyn ProxiedConnectionFactory> {
        &self.factory
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    async fn attempt(&self, server: &Arc<Server>) -> Option<Box<dyn Connection>> {
        let connection = match self.factory.connect_to(server).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::debug!(server = %server, %error, "reconnect attempt failed");
                return None;
            }
        };

        match ping(connection.as_ref(), &self.config).await {
            Ok(()) => Some(connection),
            Err(error) => {
                tracing::debug!(server = %server, %error, "status ping failed");
                let _ = connection.shutdown(true).await;
                None
            }
        }
    }
}

impl fmt::Debug for SimpleReconnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleReconnectStrategy")
            .field("servers", &self.cluster.servers().len())
            .finish()
    }
}

#[async_trait]
impl ReconnectStrategy for SimpleReconnectStrategy {
    async fn reconnect(&self, old_connection: &dyn Connection) -> Option<Box<dyn Connection>> {
        let name = old_connection.server_name();

        // The server may have only hiccuped; try it once before failing
        // over.
        if let Some(server) = self.cluster.get(&name) {
            if let Some(connection) = self.attempt(&server).await {
                tracing::info!(server = %name, "reconnected to the same server");
                return Some(connection);
            }
        }

        for server in self.selector.pick_servers() {
            if let Some(connection) = self.attempt(&server).await {
                tracing::info!(server = %server, "reconnected via fail-over");
                return Some(connection);
            }
        }

        tracing::warn!(server = %name, "reconnect exhausted all candidates");
        None
    }
}

/// Rediscovers a replica set's primary after a failover.
///
/// Every reachable member is asked who the primary is, in parallel. A
/// candidate is accepted only once the configured number of distinct
/// members (two by default) independently name it; members reporting no
/// primary neither veto nor confirm, and contradictory reports cancel
/// each other. The search is bounded by the configured reconnect
/// timeout.
pub struct ReplicaSetReconnectStrategy {
    cluster: Arc<Cluster>,
    selector: Arc<dyn ServerSelector>,
    factory: Arc<dyn ProxiedConnectionFactory>,
    config: Arc<ClientConfig>,
}

impl ReplicaSetReconnectStrategy {
    /// Creates the strategy over a factory's cluster view.
    pub fn new(
        cluster: Arc<Cluster>,
        selector: Arc<dyn ServerSelector>,
        factory: Arc<dyn ProxiedConnectionFactory>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            cluster,
            selector,
            factory,
            config,
        }
    }

    /// Returns the cluster state the strategy consults.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Returns the selector for this replica set.
    pub fn selector(&self) -> &Arc<dyn ServerSelector> {
        &self.selector
    }

    /// Returns the factory used to open replacement connections.
    pub fn connection_factory(&self) -> &Arc<dyn ProxiedConnectionFactory> {
        &self.factory
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Asks every reachable member who the primary is. Role state is
    /// not updated from these claims; only a quorum may change the
    /// cluster.
    async fn collect_claims(&self) -> Vec<(String, Option<String>)> {
        let mut tasks = Vec::new();
        for server in self.cluster.servers() {
            if server.is_unreachable() {
                continue;
            }
            let factory = self.factory.clone();
            let config = self.config.clone();
            tasks.push(tokio::spawn(async move {
                let reporter = server.canonical_name().to_string();
                let claim = Self::ask_member(&factory, &config, &server).await;
                (reporter, claim)
            }));
        }

        let mut claims = Vec::new();
        for task in tasks {
            if let Ok(answer) = task.await {
                claims.push(answer);
            }
        }
        claims
    }

    async fn ask_member(
        factory: &Arc<dyn ProxiedConnectionFactory>,
        config: &Arc<ClientConfig>,
        server: &Arc<Server>,
    ) -> Option<String> {
        let connection = match factory.connect_to(server).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::debug!(server = %server, %error, "member unreachable during reconnect");
                return None;
            }
        };

        let (callback, receiver) = FutureCallback::new();
        let message: Arc<dyn Message> = Arc::new(Command::is_master());
        let claim = match connection.send(message, Some(Box::new(callback))).await {
            Ok(_) => {
                match tokio::time::timeout(config.read_timeout(), receiver.recv()).await {
                    Ok(Ok(reply)) => reply.documents().first().and_then(|document| {
                        let identity = document.get_document("repl").unwrap_or(document);
                        identity.get_str("primary").map(Server::canonicalize)
                    }),
                    _ => None,
                }
            }
            Err(_) => None,
        };

        let _ = connection.shutdown(true).await;
        claim
    }

    /// Tallies claims into a confirmed primary, if any.
    ///
    /// Confirmation requires at least `confirmations` distinct
    /// reporters naming the same member, and that member must be the
    /// unique leader of the tally.
    fn confirmed_primary(
        claims: &[(String, Option<String>)],
        confirmations: usize,
    ) -> Option<String> {
        let mut tally: HashMap<&str, usize> = HashMap::new();
        for (_, claim) in claims {
            if let Some(primary) = claim {
                *tally.entry(primary.as_str()).or_default() += 1;
            }
        }

        let best = tally
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(name, count)| (name.to_string(), *count))?;

        if best.1 < confirmations {
            return None;
        }
        let contenders = tally.values().filter(|count| **count == best.1).count();
        if contenders > 1 {
            // Contradictory views cancel each other.
            return None;
        }
        Some(best.0)
    }
}

impl fmt::Debug for ReplicaSetReconnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaSetReconnectStrategy")
            .field("servers", &self.cluster.servers().len())
            .field("confirmations", &self.config.primary_confirmations())
            .finish()
    }
}

#[async_trait]
impl ReconnectStrategy for ReplicaSetReconnectStrategy {
    async fn reconnect(&self, old_connection: &dyn Connection) -> Option<Box<dyn Connection>> {
        let deadline = self
            .config
            .reconnect_timeout()
            .map(|timeout| Instant::now() + timeout);

        // The broken primary is no longer authoritative; until a quorum
        // agrees on a successor, nothing is writable.
        if let Some(server) = self.cluster.get(&old_connection.server_name()) {
            if server.is_writable() {
                server.set_role(ServerRole::Candidate);
            }
        }

        loop {
            let claims = self.collect_claims().await;
            let confirmed =
                Self::confirmed_primary(&claims, self.config.primary_confirmations());

            if let Some(primary_name) = confirmed {
                let server = self.cluster.add(&primary_name);
                match self.factory.connect_to(&server).await {
                    Ok(connection) => {
                        self.cluster.mark_sole_writable(&primary_name);
                        tracing::info!(primary = %primary_name, "replica set primary confirmed");
                        return Some(connection);
                    }
                    Err(error) => {
                        tracing::debug!(
                            primary = %primary_name,
                            %error,
                            "confirmed primary refused the connection"
                        );
                    }
                }
            }

            let pause = {
                let mut rng = rand::thread_rng();
                QUORUM_ROUND_PAUSE.mul_f64(rng.gen_range(0.75..1.25))
            };
            match deadline {
                Some(deadline) if Instant::now() + pause >= deadline => {
                    tracing::warn!("replica set reconnect deadline passed without quorum");
                    return None;
                }
                _ => tokio::time::sleep(pause).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(pairs: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        pairs
            .iter()
            .map(|(reporter, claim)| {
                (reporter.to_string(), claim.map(|name| name.to_string()))
            })
            .collect()
    }

    #[test]
    fn test_quorum_requires_two_confirmations() {
        let claims = claims(&[
            ("a:1", Some("b:1")),
            ("b:1", Some("b:1")),
            ("c:1", None),
        ]);
        assert_eq!(
            ReplicaSetReconnectStrategy::confirmed_primary(&claims, 2),
            Some("b:1".to_string())
        );
    }

    #[test]
    fn test_single_claim_is_not_enough() {
        let claims = claims(&[("a:1", Some("b:1")), ("b:1", None), ("c:1", None)]);
        assert_eq!(
            ReplicaSetReconnectStrategy::confirmed_primary(&claims, 2),
            None
        );
    }

    #[test]
    fn test_contradictory_claims_cancel() {
        let claims = claims(&[
            ("a:1", Some("a:1")),
            ("b:1", Some("b:1")),
            ("c:1", None),
        ]);
        assert_eq!(
            ReplicaSetReconnectStrategy::confirmed_primary(&claims, 1),
            None
        );
    }

    #[test]
    fn test_majority_beats_minority() {
        let claims = claims(&[
            ("a:1", Some("b:1")),
            ("b:1", Some("b:1")),
            ("c:1", Some("a:1")),
        ]);
        assert_eq!(
            ReplicaSetReconnectStrategy::confirmed_primary(&claims, 2),
            Some("b:1".to_string())
        );
    }

    #[test]
    fn test_no_primary_claims_do_not_confirm() {
        let claims = claims(&[("a:1", None), ("b:1", None)]);
        assert_eq!(
            ReplicaSetReconnectStrategy::confirmed_primary(&claims, 1),
            None
        );
    }

    #[test]
    fn test_quorum_count_is_tunable() {
        let claims = claims(&[
            ("a:1", Some("b:1")),
            ("b:1", Some("b:1")),
            ("c:1", Some("b:1")),
        ]);
        assert_eq!(
            ReplicaSetReconnectStrategy::confirmed_primary(&claims, 3),
            Some("b:1".to_string())
        );
        assert_eq!(
            ReplicaSetReconnectStrategy::confirmed_primary(&claims, 4),
            None
        );
    }
}
