//! Common test utilities: an in-process server speaking the wire
//! protocol with scripted replies.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mongolink_client::{ClientConfig, ClientConfigBuilder};
use mongolink_core::bson::Document;
use mongolink_core::wire::{Header, OpCode, Reply, HEADER_LENGTH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// A scripted wire-protocol server.
///
/// Messages that expect a reply (queries, get-mores) are answered from
/// the scripted queue, falling back to a repeating document once the
/// queue is empty. Fire-and-forget operations are consumed silently,
/// mirroring a real server.
pub struct MockServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: watch::Sender<bool>,
}

struct ServerState {
    scripted: Mutex<VecDeque<Document>>,
    fallback: Mutex<Option<Document>>,
    silent: AtomicBool,
    received: Mutex<Vec<(i32, i32)>>,
    next_reply_id: AtomicI32,
}

impl MockServer {
    /// Starts the server on an ephemeral local port.
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = Arc::new(ServerState {
            scripted: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            silent: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            next_reply_id: AtomicI32::new(1000),
        });

        let accept_state = state.clone();
        let mut accept_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let state = accept_state.clone();
                        let shutdown = accept_shutdown.clone();
                        tokio::spawn(serve_connection(stream, state, shutdown));
                    }
                }
            }
        });

        MockServer {
            address,
            state,
            shutdown_tx,
        }
    }

    /// The server's socket address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The server's canonical `host:port` name.
    pub fn name(&self) -> String {
        format!("{}", self.address)
    }

    /// Queues reply documents, answered in order.
    pub fn set_replies(&self, documents: Vec<Document>) {
        let mut scripted = self.state.scripted.lock().unwrap();
        scripted.clear();
        scripted.extend(documents);
    }

    /// Sets the document repeated once the scripted queue is empty.
    pub fn set_fallback(&self, document: Document) {
        *self.state.fallback.lock().unwrap() = Some(document);
    }

    /// Makes the server consume requests without ever replying.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Returns `(request_id, opcode)` for every message received, in
    /// arrival order.
    pub fn received(&self) -> Vec<(i32, i32)> {
        self.state.received.lock().unwrap().clone()
    }

    /// Stops accepting and serving.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut length_bytes = [0u8; 4];
        tokio::select! {
            _ = shutdown.changed() => return,
            read = stream.read_exact(&mut length_bytes) => {
                if read.is_err() {
                    return;
                }
            }
        }

        let length = i32::from_le_bytes(length_bytes) as usize;
        if !(HEADER_LENGTH..=64 * 1024 * 1024).contains(&length) {
            return;
        }

        let mut rest = vec![0u8; length - 4];
        if stream.read_exact(&mut rest).await.is_err() {
            return;
        }

        let mut frame = length_bytes.to_vec();
        frame.extend_from_slice(&rest[..12.min(rest.len())]);
        let Ok(header) = Header::read_from(&frame) else {
            return;
        };

        state
            .received
            .lock()
            .unwrap()
            .push((header.request_id, header.op.code()));

        let expects_reply = matches!(header.op, OpCode::Query | OpCode::GetMore);
        if !expects_reply || state.silent.load(Ordering::SeqCst) {
            continue;
        }

        let document = {
            let mut scripted = state.scripted.lock().unwrap();
            match scripted.pop_front() {
                Some(document) => Some(document),
                None => state.fallback.lock().unwrap().clone(),
            }
        };
        let Some(document) = document else {
            // Nothing scripted; swallow the request.
            continue;
        };

        let reply = Reply::new(
            state.next_reply_id.fetch_add(1, Ordering::SeqCst),
            header.request_id,
            0,
            0,
            0,
            vec![document],
        );
        let mut buffer = bytes::BytesMut::new();
        reply.write_wire(&mut buffer);
        if stream.write_all(&buffer).await.is_err() {
            return;
        }
    }
}

/// A standard identity document for a plain server process.
pub fn standalone_identity() -> Document {
    Document::new()
        .with("ismaster", true)
        .with("process", "mongod")
        .with("maxBsonObjectSize", 16 * 1024 * 1024)
        .with("version", "2.4.6")
        .with("ok", 1.0)
}

/// A standard identity document for a router process.
pub fn router_identity() -> Document {
    Document::new()
        .with("ismaster", true)
        .with("process", "mongos")
        .with("msg", "isdbgrid")
        .with("ok", 1.0)
}

/// An identity document for a replica-set member.
pub fn replica_set_identity(primary: Option<&str>, hosts: &[&str]) -> Document {
    let mut repl = Document::new();
    if let Some(primary) = primary {
        repl.insert("primary", primary);
    }
    repl.insert(
        "hosts",
        hosts
            .iter()
            .map(|host| mongolink_core::bson::Value::from(*host))
            .collect::<Vec<_>>(),
    );
    Document::new().with("repl", repl).with("ok", 1.0)
}

/// Initializes test logging once; controlled by `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A test configuration pointed at the given servers, tuned for fast
/// timeouts.
pub fn test_config(servers: &[String]) -> ClientConfig {
    ClientConfigBuilder::new()
        .servers(servers.iter().cloned())
        .read_timeout(Duration::from_millis(500))
        .connect_timeout(Duration::from_secs(2))
        .ping_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}
