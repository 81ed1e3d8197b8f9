//! Server selection strategies.

use std::sync::Arc;

use mongolink_core::{ReadPreference, ReadPreferenceMode};

use super::cluster::Cluster;
use super::server::Server;

/// A strategy producing an ordered list of candidate servers for a
/// request.
///
/// Selectors are pure views over the [`Cluster`]; they hold no mutable
/// state and tolerate racing role updates, since a stale pick fails
/// fast and is retried through the reconnect path.
pub trait ServerSelector: Send + Sync {
    /// Picks candidate servers, best first.
    fn pick_servers(&self) -> Vec<Arc<Server>>;
}

impl std::fmt::Debug for dyn ServerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSelector")
    }
}

fn order_by_latency(servers: &mut Vec<Arc<Server>>) {
    servers.retain(|server| !server.is_unreachable());
    // Ties (including unmeasured servers) fall back to insertion order,
    // keeping repeated picks stable.
    servers.sort_by_key(|server| (server.latency_key(), server.sequence()));
}

/// Selects servers by ascending average latency.
#[derive(Debug)]
pub struct LatencyServerSelector {
    cluster: Arc<Cluster>,
    writable_only: bool,
}

impl LatencyServerSelector {
    /// Creates the selector. With `writable_only` set, non-writable
    /// servers are excluded; otherwise every reachable server is a
    /// candidate.
    pub fn new(cluster: Arc<Cluster>, writable_only: bool) -> Self {
        Self {
            cluster,
            writable_only,
        }
    }
}

impl ServerSelector for LatencyServerSelector {
    fn pick_servers(&self) -> Vec<Arc<Server>> {
        let mut servers = if self.writable_only {
            self.cluster.writable_servers()
        } else {
            self.cluster.servers()
        };
        order_by_latency(&mut servers);
        servers
    }
}

/// Selects servers honoring a read preference's mode and tags, then
/// orders by latency.
#[derive(Debug)]
pub struct ReadPreferenceSelector {
    cluster: Arc<Cluster>,
    read_preference: ReadPreference,
}

impl ReadPreferenceSelector {
    /// Creates the selector.
    pub fn new(cluster: Arc<Cluster>, read_preference: ReadPreference) -> Self {
        Self {
            cluster,
            read_preference,
        }
    }

    fn secondaries(&self) -> Vec<Arc<Server>> {
        let mut servers = self.cluster.non_writable_servers();
        servers.retain(|server| {
            self.read_preference
                .matches_tags(server.tags().as_ref())
        });
        order_by_latency(&mut servers);
        servers
    }

    fn primaries(&self) -> Vec<Arc<Server>> {
        let mut servers = self.cluster.writable_servers();
        order_by_latency(&mut servers);
        servers
    }
}

impl ServerSelector for ReadPreferenceSelector {
    fn pick_servers(&self) -> Vec<Arc<Server>> {
        match self.read_preference.mode() {
            ReadPreferenceMode::Primary => self.primaries(),
            ReadPreferenceMode::Secondary => self.secondaries(),
            ReadPreferenceMode::PrimaryPreferred => {
                let mut servers = self.primaries();
                servers.extend(self.secondaries());
                servers
            }
            ReadPreferenceMode::SecondaryPreferred => {
                let mut servers = self.secondaries();
                servers.extend(self.primaries());
                servers
            }
            ReadPreferenceMode::Nearest => {
                let mut servers = self.primaries();
                servers.extend(self.secondaries());
                order_by_latency(&mut servers);
                servers
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServerRole;
    use mongolink_core::bson::Document;
    use std::time::Duration;

    fn cluster_with_latencies(latencies: &[(&str, u64, ServerRole)]) -> Arc<Cluster> {
        let cluster = Arc::new(Cluster::new());
        for (name, millis, role) in latencies {
            let server = cluster.add(name);
            server.set_role(*role);
            if *millis > 0 {
                server.update_average_latency(Duration::from_millis(*millis));
            }
        }
        cluster
    }

    fn names(servers: &[Arc<Server>]) -> Vec<String> {
        servers
            .iter()
            .map(|server| server.canonical_name().to_string())
            .collect()
    }

    #[test]
    fn test_latency_ordering() {
        let cluster = cluster_with_latencies(&[
            ("slow:1", 300, ServerRole::Writable),
            ("fast:1", 10, ServerRole::Writable),
            ("mid:1", 100, ServerRole::Writable),
        ]);

        let selector = LatencyServerSelector::new(cluster, true);
        assert_eq!(names(&selector.pick_servers()), vec!["fast:1", "mid:1", "slow:1"]);
    }

    #[test]
    fn test_latency_selection_is_stable() {
        let cluster = cluster_with_latencies(&[
            ("a:1", 50, ServerRole::Writable),
            ("b:1", 50, ServerRole::Writable),
            ("c:1", 50, ServerRole::Writable),
        ]);

        let selector = LatencyServerSelector::new(cluster, true);
        let first = names(&selector.pick_servers());
        for _ in 0..5 {
            assert_eq!(names(&selector.pick_servers()), first);
        }
        // Ties resolve in insertion order.
        assert_eq!(first, vec!["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_unmeasured_servers_sort_last() {
        let cluster = cluster_with_latencies(&[
            ("unmeasured:1", 0, ServerRole::Writable),
            ("measured:1", 80, ServerRole::Writable),
        ]);

        let selector = LatencyServerSelector::new(cluster, true);
        assert_eq!(
            names(&selector.pick_servers()),
            vec!["measured:1", "unmeasured:1"]
        );
    }

    #[test]
    fn test_writable_only_filters() {
        let cluster = cluster_with_latencies(&[
            ("primary:1", 50, ServerRole::Writable),
            ("secondary:1", 10, ServerRole::NonWritable),
        ]);

        assert_eq!(
            names(&LatencyServerSelector::new(cluster.clone(), true).pick_servers()),
            vec!["primary:1"]
        );
        assert_eq!(
            names(&LatencyServerSelector::new(cluster, false).pick_servers()),
            vec!["secondary:1", "primary:1"]
        );
    }

    #[test]
    fn test_unreachable_servers_excluded() {
        let cluster = cluster_with_latencies(&[
            ("up:1", 50, ServerRole::Writable),
            ("down:1", 10, ServerRole::Writable),
        ]);
        cluster.get("down:1").unwrap().ping_failed(1);

        let selector = LatencyServerSelector::new(cluster, true);
        assert_eq!(names(&selector.pick_servers()), vec!["up:1"]);
    }

    #[test]
    fn test_read_preference_secondary_only() {
        let cluster = cluster_with_latencies(&[
            ("primary:1", 10, ServerRole::Writable),
            ("secondary:1", 50, ServerRole::NonWritable),
        ]);

        let selector = ReadPreferenceSelector::new(cluster, ReadPreference::secondary());
        assert_eq!(names(&selector.pick_servers()), vec!["secondary:1"]);
    }

    #[test]
    fn test_read_preference_secondary_preferred_falls_back() {
        let cluster = cluster_with_latencies(&[("primary:1", 10, ServerRole::Writable)]);

        let selector =
            ReadPreferenceSelector::new(cluster, ReadPreference::secondary_preferred());
        assert_eq!(names(&selector.pick_servers()), vec!["primary:1"]);
    }

    #[test]
    fn test_read_preference_primary_preferred_orders_primary_first() {
        let cluster = cluster_with_latencies(&[
            ("secondary:1", 10, ServerRole::NonWritable),
            ("primary:1", 500, ServerRole::Writable),
        ]);

        let selector =
            ReadPreferenceSelector::new(cluster, ReadPreference::primary_preferred());
        assert_eq!(
            names(&selector.pick_servers()),
            vec!["primary:1", "secondary:1"]
        );
    }

    #[test]
    fn test_read_preference_nearest_ignores_roles() {
        let cluster = cluster_with_latencies(&[
            ("secondary:1", 10, ServerRole::NonWritable),
            ("primary:1", 500, ServerRole::Writable),
        ]);

        let selector = ReadPreferenceSelector::new(cluster, ReadPreference::nearest());
        assert_eq!(
            names(&selector.pick_servers()),
            vec!["secondary:1", "primary:1"]
        );
    }

    #[test]
    fn test_read_preference_tags_constrain_secondaries() {
        let cluster = cluster_with_latencies(&[
            ("east:1", 10, ServerRole::NonWritable),
            ("west:1", 20, ServerRole::NonWritable),
        ]);
        cluster
            .get("east:1")
            .unwrap()
            .update_from(&Document::new().with("secondary", true).with(
                "tags",
                Document::new().with("dc", "east"),
            ));
        cluster
            .get("west:1")
            .unwrap()
            .update_from(&Document::new().with("secondary", true).with(
                "tags",
                Document::new().with("dc", "west"),
            ));

        let preference =
            ReadPreference::secondary().with_tags(Document::new().with("dc", "west"));
        let selector = ReadPreferenceSelector::new(cluster, preference);
        assert_eq!(names(&selector.pick_servers()), vec!["west:1"]);
    }
}
