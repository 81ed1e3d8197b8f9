//! Decorator base for multi-server connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongolink_core::wire::Message;
use mongolink_core::Result;

use super::Connection;
use crate::callback::ReplyCallback;
use crate::state::Server;

/// Opens connections to one specific server.
///
/// Topology factories and the authenticating wrapper compose over this
/// trait: whatever a decorator does (authentication handshakes, TLS,
/// instrumentation) happens inside `connect_to`, invisibly to the
/// topology logic above it.
#[async_trait]
pub trait ProxiedConnectionFactory: Send + Sync + std::fmt::Debug {
    /// Opens a connection to the given server.
    async fn connect_to(&self, server: &Arc<Server>) -> Result<Box<dyn Connection>>;
}

/// Forwarding base for connections that wrap another connection.
///
/// Topology-aware connections embed one of these per wrapped socket and
/// delegate the [`Connection`] surface to it.
#[derive(Debug)]
pub struct ProxiedConnection {
    inner: Box<dyn Connection>,
}

impl ProxiedConnection {
    /// Wraps a connection.
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self { inner }
    }

    /// Returns the wrapped connection.
    pub fn inner(&self) -> &dyn Connection {
        self.inner.as_ref()
    }

    /// Unwraps the inner connection.
    pub fn into_inner(self) -> Box<dyn Connection> {
        self.inner
    }
}

#[async_trait]
impl Connection for ProxiedConnection {
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
