//! Identity and mutable health state for one endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use mongolink_core::bson::{Document, Value};
use mongolink_core::Version;

/// Default port appended to bare host names.
pub(crate) const DEFAULT_PORT: u16 = 27017;

/// Weight of the newest sample in the latency average.
const LATENCY_ALPHA: f64 = 0.25;

/// Sentinel for "no latency measured yet"; sorts after every real value.
const LATENCY_UNKNOWN: u64 = u64::MAX;

/// The role a server last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerRole {
    /// No identity information yet.
    #[default]
    Unknown,
    /// Accepts writes; the primary or a standalone/router process.
    Writable,
    /// Readable but not writable; a secondary.
    NonWritable,
    /// A member that may become writable, e.g. mid-election.
    Candidate,
}

/// One endpoint of the cluster: a stable identity plus mutable health,
/// latency, version, and tag state.
///
/// Shared via `Arc` by the [`Cluster`](super::Cluster), the pinger, and
/// every connection pointed at the endpoint; all mutation goes through
/// fine-grained interior locks and atomics so readers see a consistent
/// (if briefly stale) snapshot.
#[derive(Debug)]
pub struct Server {
    canonical_name: String,
    sequence: u64,
    addresses: RwLock<Vec<SocketAddr>>,
    pinned_address: RwLock<Option<SocketAddr>>,
    role: RwLock<ServerRole>,
    tags: RwLock<Option<Document>>,
    version: RwLock<Version>,
    max_document_size: AtomicU64,
    average_latency_nanos: AtomicU64,
    messages_sent: AtomicU64,
    replies_received: AtomicU64,
    connection_opens: AtomicU64,
    connection_failures: AtomicU64,
    consecutive_ping_failures: AtomicU32,
    unreachable: AtomicBool,
}

impl Server {
    pub(crate) fn new(canonical_name: String, sequence: u64) -> Self {
        let addresses = canonical_name
            .parse::<SocketAddr>()
            .map(|addr| vec![addr])
            .unwrap_or_default();

        Self {
            canonical_name,
            sequence,
            addresses: RwLock::new(addresses),
            pinned_address: RwLock::new(None),
            role: RwLock::new(ServerRole::Unknown),
            tags: RwLock::new(None),
            version: RwLock::new(Version::unknown()),
            max_document_size: AtomicU64::new(
                mongolink_core::wire::DEFAULT_MAX_DOCUMENT_SIZE as u64,
            ),
            average_latency_nanos: AtomicU64::new(LATENCY_UNKNOWN),
            messages_sent: AtomicU64::new(0),
            replies_received: AtomicU64::new(0),
            connection_opens: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            consecutive_ping_failures: AtomicU32::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Canonicalizes an endpoint name: lowercased host, explicit port.
    pub fn canonicalize(name: &str) -> String {
        let trimmed = name.trim();
        match trimmed.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                format!("{}:{}", host.to_ascii_lowercase(), port)
            }
            _ => format!("{}:{}", trimmed.to_ascii_lowercase(), DEFAULT_PORT),
        }
    }

    /// Returns the canonical `host:port` name.
    pub fn canonical_name(&self) -> &str {
        &self.canonical_name
    }

    /// Returns the order in which the server joined the cluster, used
    /// to break latency ties.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the resolved socket addresses, the pinned one first.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        let addresses = self.addresses.read().unwrap().clone();
        let pinned = *self.pinned_address.read().unwrap();
        match pinned {
            Some(pinned) => {
                let mut ordered = vec![pinned];
                ordered.extend(addresses.into_iter().filter(|addr| *addr != pinned));
                ordered
            }
            None => addresses,
        }
    }

    /// Records addresses resolved for this server's host name.
    pub fn set_addresses(&self, addresses: Vec<SocketAddr>) {
        *self.addresses.write().unwrap() = addresses;
    }

    /// Returns the last reported role.
    pub fn role(&self) -> ServerRole {
        *self.role.read().unwrap()
    }

    /// Returns true if the server last reported itself writable.
    pub fn is_writable(&self) -> bool {
        self.role() == ServerRole::Writable
    }

    /// Demotes or promotes the server directly. Used by the replica-set
    /// reconnect once a quorum has settled on a new primary.
    pub fn set_role(&self, role: ServerRole) {
        *self.role.write().unwrap() = role;
    }

    /// Returns the tag set from the last identity reply.
    pub fn tags(&self) -> Option<Document> {
        self.tags.read().unwrap().clone()
    }

    /// Returns the last reported server version.
    pub fn version(&self) -> Version {
        self.version.read().unwrap().clone()
    }

    /// Returns the maximum permitted encoded document size.
    pub fn max_document_size(&self) -> usize {
        self.max_document_size.load(Ordering::Relaxed) as usize
    }

    /// Returns the running average latency, if measured.
    pub fn average_latency(&self) -> Option<Duration> {
        match self.average_latency_nanos.load(Ordering::Relaxed) {
            LATENCY_UNKNOWN => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Sort key for latency ordering; unmeasured servers sort last.
    pub(crate) fn latency_key(&self) -> u64 {
        self.average_latency_nanos.load(Ordering::Relaxed)
    }

    /// Folds a new latency sample into the exponentially-weighted
    /// average.
    pub fn update_average_latency(&self, sample: Duration) {
        let sample = sample.as_nanos().min(u128::from(u64::MAX - 1)) as u64;
        let previous = self.average_latency_nanos.load(Ordering::Relaxed);
        let next = if previous == LATENCY_UNKNOWN {
            sample
        } else {
            (LATENCY_ALPHA * sample as f64 + (1.0 - LATENCY_ALPHA) * previous as f64) as u64
        };
        self.average_latency_nanos.store(next, Ordering::Relaxed);
    }

    /// Applies a status document from an identity or status request.
    ///
    /// Role demotion is immediate on any contradicting update;
    /// promotion to writable requires a positive identity (`ismaster`
    /// true, or this server named as the primary).
    pub fn update_from(&self, document: &Document) {
        // Status replies nest the replication fields under `repl`.
        let identity = document.get_document("repl").unwrap_or(document);

        let is_master = identity.get_bool("ismaster");
        let is_secondary = identity.get_bool("secondary");
        let named_primary = identity
            .get_str("primary")
            .map(|primary| Server::canonicalize(primary) == self.canonical_name);

        if is_master == Some(true) || named_primary == Some(true) {
            self.set_role(ServerRole::Writable);
        } else if is_secondary == Some(true) {
            self.set_role(ServerRole::NonWritable);
        } else if is_master == Some(false) {
            // Contradicts a writable role; mid-election members stay
            // candidates rather than dropping to unknown.
            if self.role() != ServerRole::NonWritable {
                self.set_role(ServerRole::Candidate);
            }
        }

        if let Some(tags) = identity.get_document("tags").or_else(|| document.get_document("tags"))
        {
            *self.tags.write().unwrap() = Some(tags.clone());
        }

        if let Some(size) = document.get_int("maxBsonObjectSize") {
            if size > 0 {
                self.max_document_size.store(size as u64, Ordering::Relaxed);
            }
        }

        if let Some(version) = document.get_str("version") {
            if let Ok(version) = version.parse::<Version>() {
                *self.version.write().unwrap() = version;
            }
        }
    }

    /// Extracts the member names an identity document advertises:
    /// `hosts` plus `passives`.
    pub fn discovered_members(document: &Document) -> Vec<String> {
        let identity = document.get_document("repl").unwrap_or(document);
        let mut members = Vec::new();
        for field in ["hosts", "passives"] {
            if let Some(values) = identity.get_array(field) {
                for value in values {
                    if let Value::String(name) = value {
                        members.push(name.clone());
                    }
                }
            }
        }
        members
    }

    /// Records a successful connection open, pinning the address that
    /// worked.
    pub fn connection_opened(&self, address: SocketAddr) {
        self.connection_opens.fetch_add(1, Ordering::Relaxed);
        *self.pinned_address.write().unwrap() = Some(address);
    }

    /// Records a failed connection attempt.
    pub fn connect_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection torn down by a receive error.
    pub fn connection_terminated(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records messages written to the wire.
    pub fn increment_messages_sent(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a reply read off the wire.
    pub fn increment_replies_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of messages sent to this server.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Returns the number of replies received from this server.
    pub fn replies_received(&self) -> u64 {
        self.replies_received.load(Ordering::Relaxed)
    }

    /// Returns the number of connections opened to this server.
    pub fn connection_opens(&self) -> u64 {
        self.connection_opens.load(Ordering::Relaxed)
    }

    /// Returns the number of failed or terminated connections.
    pub fn connection_failures(&self) -> u64 {
        self.connection_failures.load(Ordering::Relaxed)
    }

    /// Records a failed health probe; after `threshold` consecutive
    /// failures the server is marked unreachable.
    pub fn ping_failed(&self, threshold: u32) {
        let failures = self.consecutive_ping_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= threshold {
            self.unreachable.store(true, Ordering::Relaxed);
        }
    }

    /// Records a successful health probe, clearing any unreachable
    /// mark.
    pub fn ping_succeeded(&self) {
        self.consecutive_ping_failures.store(0, Ordering::Relaxed);
        self.unreachable.store(false, Ordering::Relaxed);
    }

    /// Returns true if repeated probes have failed and the server is
    /// excluded from selection.
    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Relaxed)
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_name)
    }
}
