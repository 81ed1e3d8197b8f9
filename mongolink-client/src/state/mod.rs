//! Cluster state: servers, selection, and health probing.

mod cluster;
mod pinger;
mod selector;
mod server;

pub use cluster::Cluster;
pub use pinger::ClusterPinger;
pub use selector::{LatencyServerSelector, ReadPreferenceSelector, ServerSelector};
pub use server::{Server, ServerRole};
