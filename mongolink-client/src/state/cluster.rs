//! The set of known servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use mongolink_core::Version;

use super::server::{Server, ServerRole};

/// All servers known for one logical cluster, keyed by canonical name.
///
/// A [`Server`] is created once per name and never replaced; factories,
/// selectors, the pinger, and live connections all share the same
/// `Arc<Server>` for an endpoint.
#[derive(Debug, Default)]
pub struct Cluster {
    servers: RwLock<HashMap<String, Arc<Server>>>,
    next_sequence: AtomicU64,
}

impl Cluster {
    /// Creates an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the server with the given name, adding it in the
    /// `Unknown` role if it is new. Idempotent on the canonical name.
    pub fn add(&self, name: &str) -> Arc<Server> {
        let canonical = Server::canonicalize(name);

        if let Some(server) = self.servers.read().unwrap().get(&canonical) {
            return server.clone();
        }

        let mut servers = self.servers.write().unwrap();
        servers
            .entry(canonical.clone())
            .or_insert_with(|| {
                let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(server = %canonical, "added server to cluster");
                Arc::new(Server::new(canonical.clone(), sequence))
            })
            .clone()
    }

    /// Returns the server with the given name, if known.
    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers
            .read()
            .unwrap()
            .get(&Server::canonicalize(name))
            .cloned()
    }

    /// Removes a server. Existing connections keep their `Arc` but the
    /// server no longer participates in selection.
    pub fn remove(&self, name: &str) -> Option<Arc<Server>> {
        self.servers
            .write()
            .unwrap()
            .remove(&Server::canonicalize(name))
    }

    /// Returns every known server, in insertion order.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        let mut servers: Vec<Arc<Server>> =
            self.servers.read().unwrap().values().cloned().collect();
        servers.sort_by_key(|server| server.sequence());
        servers
    }

    /// Returns the servers currently reported writable, in insertion
    /// order.
    pub fn writable_servers(&self) -> Vec<Arc<Server>> {
        self.matching(Server::is_writable)
    }

    /// Returns the servers currently reported readable but not
    /// writable, in insertion order.
    pub fn non_writable_servers(&self) -> Vec<Arc<Server>> {
        self.matching(|server| server.role() == ServerRole::NonWritable)
    }

    /// Returns the servers matching a predicate, in insertion order.
    pub fn matching(&self, predicate: impl Fn(&Server) -> bool) -> Vec<Arc<Server>> {
        let mut matched: Vec<Arc<Server>> = self
            .servers
            .read()
            .unwrap()
            .values()
            .filter(|server| predicate(server))
            .cloned()
            .collect();
        matched.sort_by_key(|server| server.sequence());
        matched
    }

    /// Promotes one server to the sole writable member, demoting every
    /// other writable server. Used once a reconnect quorum settles on a
    /// new primary.
    pub fn mark_sole_writable(&self, name: &str) -> Arc<Server> {
        let primary = self.add(name);
        for server in self.servers() {
            if server.canonical_name() != primary.canonical_name() && server.is_writable() {
                server.set_role(ServerRole::NonWritable);
            }
        }
        primary.set_role(ServerRole::Writable);
        primary
    }

    /// Returns the lowest server version in the cluster.
    pub fn minimum_server_version(&self) -> Version {
        self.servers
            .read()
            .unwrap()
            .values()
            .map(|server| server.version())
            .filter(|version| !version.is_unknown())
            .min()
            .unwrap_or_else(Version::unknown)
    }

    /// Returns the highest server version in the cluster.
    pub fn maximum_server_version(&self) -> Version {
        self.servers
            .read()
            .unwrap()
            .values()
            .map(|server| server.version())
            .filter(|version| !version.is_unknown())
            .max()
            .unwrap_or_else(Version::unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongolink_core::bson::Document;

    #[test]
    fn test_add_is_idempotent_on_canonical_name() {
        let cluster = Cluster::new();
        let first = cluster.add("Foo:27017");
        let second = cluster.add("foo:27017");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cluster.servers().len(), 1);
    }

    #[test]
    fn test_get_and_remove() {
        let cluster = Cluster::new();
        cluster.add("a:27017");
        assert!(cluster.get("a:27017").is_some());
        assert!(cluster.get("b:27017").is_none());

        cluster.remove("a:27017");
        assert!(cluster.get("a:27017").is_none());
    }

    #[test]
    fn test_writable_enumeration() {
        let cluster = Cluster::new();
        let a = cluster.add("a:27017");
        let b = cluster.add("b:27017");
        cluster.add("c:27017");

        a.set_role(ServerRole::Writable);
        b.set_role(ServerRole::NonWritable);

        let writable = cluster.writable_servers();
        assert_eq!(writable.len(), 1);
        assert_eq!(writable[0].canonical_name(), "a:27017");
        assert_eq!(cluster.non_writable_servers().len(), 1);
    }

    #[test]
    fn test_servers_in_insertion_order() {
        let cluster = Cluster::new();
        for name in ["z:1", "a:1", "m:1"] {
            cluster.add(name);
        }
        let servers = cluster.servers();
        let names: Vec<&str> = servers
            .iter()
            .map(|server| server.canonical_name())
            .map(|name| name.split(':').next().unwrap())
            .collect();
        // Insertion order, not lexicographic.
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_mark_sole_writable_demotes_others() {
        let cluster = Cluster::new();
        let old = cluster.add("old:27017");
        old.set_role(ServerRole::Writable);

        let new = cluster.mark_sole_writable("new:27017");
        assert!(new.is_writable());
        assert!(!old.is_writable());
        assert_eq!(cluster.writable_servers().len(), 1);
    }

    #[test]
    fn test_version_aggregation() {
        let cluster = Cluster::new();
        cluster.add("a:1").update_from(
            &Document::new().with("ismaster", true).with("version", "2.4.6"),
        );
        cluster.add("b:1").update_from(
            &Document::new().with("ismaster", false).with("version", "2.6.0"),
        );
        cluster.add("c:1"); // Version still unknown.

        assert_eq!(cluster.minimum_server_version().to_string(), "2.4.6");
        assert_eq!(cluster.maximum_server_version().to_string(), "2.6.0");
    }

    #[test]
    fn test_version_aggregation_empty_cluster() {
        let cluster = Cluster::new();
        assert!(cluster.minimum_server_version().is_unknown());
        assert!(cluster.maximum_server_version().is_unknown());
    }
}
