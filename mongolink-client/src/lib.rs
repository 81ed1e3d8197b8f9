//! Asynchronous client runtime for a document database cluster.
//!
//! The runtime is assembled bottom-up: [`connection::SocketConnection`]
//! owns one pipelined socket, [`state`] tracks the cluster's servers and
//! their health, [`factory`] discovers the topology and produces
//! connections for it, and [`reconnect`] restores service after
//! failures. [`Client`] is the surface consumed by the collection and
//! cursor layers above.

pub mod callback;
pub mod client;
pub mod config;
pub mod connection;
pub mod durability;
pub mod factory;
pub mod reconnect;
pub mod state;

pub use callback::{FutureCallback, NoOpCallback, ReplyCallback, TaskExecutor, TokioExecutor};
pub use client::{Client, SerializedClient};
pub use config::{ClientConfig, ClientConfigBuilder, Credentials, LockType};
pub use connection::Connection;
pub use durability::Durability;
pub use factory::{BootstrapConnectionFactory, ClusterType, ConnectionFactory};
pub use mongolink_core::wire::Message;
pub use mongolink_core::{Error, ReadPreference, ReadPreferenceMode, Result};
