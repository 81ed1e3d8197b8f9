//! Connections to individual servers.

mod pending;
mod proxy;
mod socket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongolink_core::wire::Message;
use mongolink_core::Result;

use crate::callback::ReplyCallback;

pub use pending::{PendingMessage, PendingQueue};
pub use proxy::{ProxiedConnection, ProxiedConnectionFactory};
pub use socket::SocketConnection;

/// A connection to the cluster, able to carry pipelined requests.
///
/// `send` enqueues the message and returns the canonical name of the
/// server that accepted it. When the message carries a callback the
/// callback is completed exactly once, with the reply or with an error.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends one message. Fails synchronously only if the connection is
    /// shut down, pre-send validation rejects the message, or the
    /// pending queue cannot accept it after buffering flushes.
    async fn send(
        &self,
        message: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String>;

    /// Sends two linked messages back to back, e.g. an insert followed
    /// by its get-last-error. The callback attaches to the second
    /// message; both land on the same server with consecutive request
    /// ids.
    async fn send_pair(
        &self,
        first: Arc<dyn Message>,
        second: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String>;

    /// Forces any buffered bytes onto the wire.
    async fn flush(&self) -> Result<()>;

    /// Shuts the connection down.
    ///
    /// Without `force` the connection drains: externally originated
    /// sends are refused, a no-op keep-alive wakes the receive task, and
    /// the socket closes once pending replies arrive. With `force` the
    /// socket closes immediately and every pending callback completes
    /// with a connection-lost error before this method returns.
    async fn shutdown(&self, force: bool) -> Result<()>;

    /// Begins a graceful shutdown; shorthand for `shutdown(false)`.
    async fn stop(&self) {
        let _ = self.shutdown(false).await;
    }

    /// Returns true if the connection is open and not shutting down.
    fn is_available(&self) -> bool;

    /// Returns true if no requests are awaiting replies.
    fn is_idle(&self) -> bool;

    /// Returns true if the connection has not been closed.
    fn is_open(&self) -> bool;

    /// Returns true if a graceful shutdown is in progress.
    fn is_shutting_down(&self) -> bool;

    /// Returns the number of requests awaiting replies.
    fn pending_count(&self) -> usize;

    /// Returns the canonical name of the connected server.
    fn server_name(&self) -> String;

    /// Waits for the connection to finish closing, up to `timeout`.
    async fn wait_closed(&self, timeout: Duration);
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({})", self.server_name())
    }
}
