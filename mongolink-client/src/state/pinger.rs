//! Periodic health and latency probing of cluster servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use mongolink_core::wire::{Command, Message};
use mongolink_core::{Error, Result};
use tokio::sync::{watch, Mutex};
use tracing::instrument;

use super::cluster::Cluster;
use super::server::Server;
use crate::callback::FutureCallback;
use crate::config::ClientConfig;
use crate::connection::{Connection, ProxiedConnectionFactory};

/// Consecutive probe failures before a server is marked unreachable.
const UNREACHABLE_THRESHOLD: u32 = 3;

/// Probes every known server on an interval, feeding latency, role,
/// tag, and version updates into the [`Cluster`].
///
/// The pinger keeps one probe connection per server, reopening it when
/// it breaks. An unreachable server stays in the cluster but is skipped
/// by selectors until a probe succeeds again.
#[derive(Debug)]
pub struct ClusterPinger {
    cluster: Arc<Cluster>,
    factory: Arc<dyn ProxiedConnectionFactory>,
    config: Arc<ClientConfig>,
    probes: Mutex<HashMap<String, Arc<dyn Connection>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClusterPinger {
    /// Creates a pinger. No probing happens until
    /// [`initial_sweep`](Self::initial_sweep) or [`start`](Self::start)
    /// is called.
    pub fn new(
        cluster: Arc<Cluster>,
        factory: Arc<dyn ProxiedConnectionFactory>,
        config: Arc<ClientConfig>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cluster,
            factory,
            config,
            probes: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Probes every known server once, so selection has latencies and
    /// roles to work with before the factory's bootstrap returns.
    #[instrument(name = "pinger.initial_sweep", skip(self))]
    pub async fn initial_sweep(&self) {
        for server in self.cluster.servers() {
            if let Err(error) = self.ping(&server).await {
                tracing::debug!(server = %server, %error, "initial sweep ping failed");
            }
        }
    }

    /// Starts the periodic sweep task.
    pub fn start(self: &Arc<Self>) {
        let pinger = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(pinger.config.ping_interval());
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the initial sweep
            // already covered it.
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticks.tick() => pinger.sweep().await,
                }
            }
            pinger.close_probes().await;
        });
    }

    /// Stops the periodic sweep and closes probe connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn sweep(&self) {
        for server in self.cluster.servers() {
            if *self.shutdown_tx.subscribe().borrow() {
                return;
            }
            match self.ping(&server).await {
                Ok(()) => {}
                Err(error) => {
                    tracing::debug!(server = %server, %error, "ping failed");
                }
            }
        }
    }

    /// Probes one server: identity request, latency sample, state
    /// update.
    pub async fn ping(&self, server: &Arc<Server>) -> Result<()> {
        let result = self.ping_inner(server).await;
        match &result {
            Ok(()) => server.ping_succeeded(),
            Err(_) => {
                server.ping_failed(UNREACHABLE_THRESHOLD);
                self.probes.lock().await.remove(server.canonical_name());
            }
        }
        result
    }

    async fn ping_inner(&self, server: &Arc<Server>) -> Result<()> {
        let connection = self.probe_connection(server).await?;

        let (callback, receiver) = FutureCallback::new();
        let message: Arc<dyn Message> = Arc::new(Command::is_master());
        let started = Instant::now();

        connection
            .send(message, Some(Box::new(callback)))
            .await?;

        let reply = tokio::time::timeout(self.config.read_timeout(), receiver.recv())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "ping of {} timed out after {:?}",
                    server,
                    self.config.read_timeout()
                ))
            })??;

        let reply = reply.verify()?;
        let document = reply
            .documents()
            .first()
            .ok_or_else(|| Error::Protocol("identity reply carried no document".to_string()))?;

        server.update_average_latency(started.elapsed());
        server.update_from(document);
        Ok(())
    }

    async fn probe_connection(&self, server: &Arc<Server>) -> Result<Arc<dyn Connection>> {
        let mut probes = self.probes.lock().await;
        if let Some(existing) = probes.get(server.canonical_name()) {
            if existing.is_available() {
                return Ok(existing.clone());
            }
            probes.remove(server.canonical_name());
        }

        let connection: Arc<dyn Connection> =
            Arc::from(self.factory.connect_to(server).await?);
        probes.insert(server.canonical_name().to_string(), connection.clone());
        Ok(connection)
    }

    async fn close_probes(&self) {
        let mut probes = self.probes.lock().await;
        for (_, connection) in probes.drain() {
            let _ = connection.shutdown(true).await;
        }
    }
}
