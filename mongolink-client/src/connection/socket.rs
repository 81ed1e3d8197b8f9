//! A single pipelined socket connection to one server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use mongolink_core::wire::{Command, Message, MessageCodec, Reply};
use mongolink_core::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::Decoder;

use super::pending::{PendingMessage, PendingQueue};
use super::Connection;
use crate::callback::{NoOpCallback, ReplyCallback, ReplyHandler};
use crate::config::ClientConfig;
use crate::state::Server;

tokio::task_local! {
    /// Set for the lifetime of a connection's receive task, so a send
    /// issued from a callback can be recognized as re-entrant.
    static ON_RECEIVE_TASK: ();
}

fn on_receive_task() -> bool {
    ON_RECEIVE_TASK.try_with(|_| ()).is_ok()
}

/// One TCP connection to one server.
///
/// Requests from any number of tasks are pipelined onto the socket; a
/// dedicated receive task reads frames, correlates replies to pending
/// callbacks in FIFO-skip order, and counts idle ticks. Cloning yields
/// another handle to the same connection.
#[derive(Clone)]
pub struct SocketConnection {
    shared: Arc<Shared>,
}

struct Shared {
    server: Arc<Server>,
    config: Arc<ClientConfig>,
    open: AtomicBool,
    shutting_down: AtomicBool,
    next_request_id: AtomicI32,
    pending: PendingQueue,
    send_buffer: Mutex<BytesMut>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Count of sends buffered on the receive task awaiting its flush.
    reader_needs_flush: AtomicUsize,
    closed_tx: watch::Sender<bool>,
}

impl SocketConnection {
    /// Opens a connection and starts its receive task.
    pub async fn connect(server: Arc<Server>, config: Arc<ClientConfig>) -> Result<Self> {
        let stream = Self::open_socket(&server, &config).await?;
        let (read_half, write_half) = stream.into_split();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: PendingQueue::new(config.max_pending_per_connection(), config.lock_type()),
            server,
            config,
            open: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            next_request_id: AtomicI32::new(1),
            send_buffer: Mutex::new(BytesMut::with_capacity(32 * 1024)),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader_needs_flush: AtomicUsize::new(0),
            closed_tx,
        });

        tokio::spawn(Shared::receive_task(shared.clone(), read_half, closed_rx));

        tracing::debug!(server = %shared.server, "connection established");
        Ok(Self { shared })
    }

    async fn open_socket(server: &Arc<Server>, config: &ClientConfig) -> Result<TcpStream> {
        let mut addresses = server.addresses();
        if addresses.is_empty() {
            match tokio::net::lookup_host(server.canonical_name()).await {
                Ok(resolved) => {
                    addresses = resolved.collect();
                    server.set_addresses(addresses.clone());
                }
                Err(error) => {
                    server.connect_failed();
                    return Err(Error::Io(format!(
                        "failed to resolve {}: {error}",
                        server.canonical_name()
                    )));
                }
            }
        }

        let mut last = None;
        for address in addresses {
            match Self::try_open(address, config).await {
                Ok(stream) => {
                    server.connection_opened(address);
                    return Ok(stream);
                }
                Err(error) => {
                    tracing::debug!(server = %server, %address, %error, "address failed");
                    last = Some(error);
                }
            }
        }

        server.connect_failed();
        Err(last.unwrap_or_else(|| {
            Error::Io(format!("no addresses for {}", server.canonical_name()))
        }))
    }

    async fn try_open(address: SocketAddr, config: &ClientConfig) -> Result<TcpStream> {
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Err(error) = socket.set_keepalive(true) {
            tracing::debug!(%address, %error, "SO_KEEPALIVE not applied");
        }

        let stream = timeout(config.connect_timeout(), socket.connect(address))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "connect to {address} timed out after {:?}",
                    config.connect_timeout()
                ))
            })?
            .map_err(|error| Error::Io(format!("failed to connect to {address}: {error}")))?;

        // Some transports refuse TCP_NODELAY; that is not fatal.
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(%address, %error, "TCP_NODELAY not applied");
        }
        Ok(stream)
    }

    /// Returns the server this connection points at.
    pub fn server(&self) -> &Arc<Server> {
        &self.shared.server
    }

    async fn enqueue(
        &self,
        messages: &[Arc<dyn Message>],
        callback: Option<Box<dyn ReplyCallback>>,
        internal: bool,
    ) -> Result<String> {
        let shared = &self.shared;

        if !shared.open.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost(format!(
                "connection to {} is closed",
                shared.server
            )));
        }
        if !internal && shared.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown(format!(
                "connection to {} is shutting down",
                shared.server
            )));
        }

        // Pre-send validation fails the call before any bytes are
        // buffered.
        let max_document_size = shared.server.max_document_size();
        let server_version = shared.server.version();
        for message in messages {
            message.validate(max_document_size, &server_version)?;
        }

        let on_reader = on_receive_task();
        let permit = match (&callback, on_reader) {
            (None, _) => None,
            (Some(_), false) => Some(match shared.pending.try_reserve() {
                Some(permit) => permit,
                None => {
                    // Push what we have out before waiting for a slot.
                    shared.flush().await?;
                    shared.pending.reserve().await?
                }
            }),
            (Some(_), true) => Some(match shared.pending.try_reserve() {
                Some(permit) => permit,
                None => {
                    // The receive task must never wait on itself.
                    shared.flush().await?;
                    shared.pending.try_reserve().ok_or(Error::QueueFull {
                        capacity: shared.pending.capacity(),
                    })?
                }
            }),
        };

        {
            // Ids are assigned and the pending entry recorded under the
            // buffer lock, before any byte can reach the wire; the
            // receive task can then assume an empty pending queue means
            // no reply is owed.
            let mut buffer = shared.send_buffer.lock().unwrap();
            let mut last_id = 0;
            for message in messages {
                last_id = shared.next_request_id.fetch_add(1, Ordering::SeqCst);
                MessageCodec::encode_message(last_id, message.as_ref(), &mut buffer);
            }
            if let Some(permit) = permit {
                let retained = messages.last().expect("send of zero messages").clone();
                shared
                    .pending
                    .push(permit, PendingMessage::new(last_id, retained, callback));
            }
            shared.server.increment_messages_sent(messages.len() as u64);
        }

        if on_reader {
            shared.reader_needs_flush.fetch_add(1, Ordering::SeqCst);
        } else {
            shared.flush().await?;
        }

        Ok(shared.server.canonical_name().to_string())
    }
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection")
            .field("server", &self.shared.server.canonical_name())
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[async_trait]
impl Connection for SocketConnection {
    async fn send(
        &self,
        message: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        self.enqueue(std::slice::from_ref(&message), callback, false)
            .await
    }

    async fn send_pair(
        &self,
        first: Arc<dyn Message>,
        second: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Result<String> {
        self.enqueue(&[first, second], callback, false).await
    }

    async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    async fn shutdown(&self, force: bool) -> Result<()> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        if force {
            self.shared
                .teardown(Some(Error::ConnectionLost(format!(
                    "connection to {} forcibly closed",
                    self.shared.server
                ))))
                .await;
        } else if self.is_open() {
            // A no-op identity round trip wakes the receive task so the
            // drain completes promptly.
            let wake: Arc<dyn Message> = Arc::new(Command::is_master());
            let _ = self
                .enqueue(
                    std::slice::from_ref(&wake),
                    Some(Box::new(NoOpCallback::new())),
                    true,
                )
                .await;
            let _ = self.shared.flush().await;
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.is_open() && !self.is_shutting_down()
    }

    fn is_idle(&self) -> bool {
        self.shared.pending.is_empty()
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    fn server_name(&self) -> String {
        self.shared.server.canonical_name().to_string()
    }

    async fn wait_closed(&self, timeout: Duration) {
        // A slow poll; closure is signalled by the receive task's exit.
        let deadline = Instant::now() + timeout;
        while self.is_open() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Shared {
    /// Writes and flushes everything buffered, preserving send order
    /// across concurrent flushers via the writer lock.
    async fn flush(&self) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let bytes = {
            // The mark is cleared under the buffer lock so a re-entrant
            // send cannot mark between our split and the reset.
            let mut buffer = self.send_buffer.lock().unwrap();
            self.reader_needs_flush.store(0, Ordering::SeqCst);
            buffer.split()
        };

        if bytes.is_empty() {
            return Ok(());
        }

        let writer = writer_guard.as_mut().ok_or_else(|| {
            Error::ConnectionLost(format!("connection to {} is closed", self.server))
        })?;

        let outcome = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(error) = outcome {
            drop(writer_guard);
            let error = Error::ConnectionLost(format!(
                "failed to write to {}: {error}",
                self.server
            ));
            self.teardown(Some(error.clone())).await;
            return Err(error);
        }
        Ok(())
    }

    async fn receive_task(
        shared: Arc<Shared>,
        read_half: OwnedReadHalf,
        mut closed_rx: watch::Receiver<bool>,
    ) {
        ON_RECEIVE_TASK
            .scope((), async move {
                match Shared::receive_frames(&shared, read_half, &mut closed_rx).await {
                    Ok(()) => shared.teardown(None).await,
                    Err(error) => {
                        tracing::debug!(server = %shared.server, %error, "receive loop ended");
                        shared.server.connection_terminated();
                        // Whatever broke the stream, in-flight requests
                        // see a lost connection.
                        let error = match error {
                            Error::ConnectionLost(_) => error,
                            other => Error::ConnectionLost(other.to_string()),
                        };
                        shared.teardown(Some(error)).await;
                    }
                }
            })
            .await;
    }

    async fn receive_frames(
        shared: &Arc<Shared>,
        mut read_half: OwnedReadHalf,
        closed_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut codec = MessageCodec::new();
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let mut idle_ticks = 0u32;

        loop {
            // Drain every decodable frame before blocking again.
            while let Some(reply) = codec.decode(&mut buffer)? {
                idle_ticks = 0;
                shared.dispatch_reply(reply).await;
                shared.receiver_flush().await;
            }
            shared.receiver_flush().await;

            if *closed_rx.borrow() {
                return Ok(());
            }
            if shared.shutting_down.load(Ordering::SeqCst) && shared.pending.is_empty() {
                return Ok(());
            }

            tokio::select! {
                _ = closed_rx.changed() => return Ok(()),
                read = timeout(shared.config.read_timeout(), read_half.read_buf(&mut buffer)) => {
                    match read {
                        Err(_elapsed) => {
                            idle_ticks += 1;
                            if idle_ticks >= shared.config.max_idle_tick_count() {
                                tracing::debug!(
                                    server = %shared.server,
                                    ticks = idle_ticks,
                                    "idle limit reached, draining connection"
                                );
                                shared.shutting_down.store(true, Ordering::SeqCst);
                            }
                        }
                        Ok(Ok(0)) => {
                            if shared.shutting_down.load(Ordering::SeqCst)
                                && shared.pending.is_empty()
                            {
                                return Ok(());
                            }
                            return Err(Error::ConnectionLost(format!(
                                "remote connection closed: {}",
                                shared.server
                            )));
                        }
                        Ok(Ok(_bytes_read)) => {}
                        Ok(Err(error)) => {
                            return Err(Error::ConnectionLost(format!(
                                "failed to read from {}: {error}",
                                shared.server
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Correlates a reply with its pending request.
    ///
    /// Pending entries are popped in FIFO order until the ids match;
    /// entries popped along the way were skipped by the server and
    /// complete with a no-reply error. An unmatched reply is logged and
    /// discarded.
    async fn dispatch_reply(&self, reply: Reply) {
        self.server.increment_replies_received();
        let reply_id = reply.response_to();

        loop {
            match self.pending.poll() {
                None => {
                    tracing::warn!(
                        server = %self.server,
                        reply_id,
                        "could not find the callback for reply"
                    );
                    return;
                }
                Some(entry) if entry.message_id() == reply_id => {
                    self.server.update_average_latency(entry.latency());
                    if let Some(callback) = entry.into_callback() {
                        ReplyHandler::reply(self.config.executor(), callback, reply).await;
                    }
                    return;
                }
                Some(skipped) => {
                    ReplyHandler::raise_error(
                        self.config.executor(),
                        skipped.into_callback(),
                        Error::NoReply,
                    )
                    .await;
                }
            }
        }
    }

    /// Flushes bytes a re-entrant send left behind, once the pending
    /// queue has drained down to the marked depth.
    async fn receiver_flush(&self) {
        let marks = self.reader_needs_flush.load(Ordering::SeqCst);
        if marks != 0 && self.pending.len() <= marks {
            if let Err(error) = self.flush().await {
                tracing::warn!(server = %self.server, %error, "receiver flush failed");
            }
        }
    }

    /// Closes the socket and fails anything still pending. Idempotent;
    /// entries are popped at most once so no callback fires twice.
    async fn teardown(&self, error: Option<Error>) {
        self.open.store(false, Ordering::SeqCst);
        self.shutting_down.store(true, Ordering::SeqCst);
        self.pending.close();

        let error = error.unwrap_or_else(|| {
            Error::ConnectionLost(format!("connection to {} closed", self.server))
        });
        while let Some(entry) = self.pending.poll() {
            ReplyHandler::raise_error(self.config.executor(), entry.into_callback(), error.clone())
                .await;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.closed_tx.send(true);
        tracing::debug!(server = %self.server, "connection closed");
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("server", &self.server.canonical_name())
            .finish()
    }
}
