//! Client configuration types and builder.

use std::sync::Arc;
use std::time::Duration;

use mongolink_core::{Error, ReadPreference, Result};

use crate::callback::TaskExecutor;
use crate::durability::Durability;

/// Default seed endpoint.
const DEFAULT_SERVER: &str = "127.0.0.1:27017";
/// Default bound on the per-connection pending-message queue.
const DEFAULT_MAX_PENDING_PER_CONNECTION: usize = 1024;
/// Default socket read timeout, also the idle-tick unit.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Default bound on TCP connect.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default idle-tick budget before a graceful shutdown.
const DEFAULT_MAX_IDLE_TICK_COUNT: u32 = u32::MAX;
/// Default pinger sweep interval.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
/// Default number of distinct members that must confirm a primary.
const DEFAULT_PRIMARY_CONFIRMATIONS: usize = 2;

/// Synchronization variant for the pending-message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    /// A parking mutex; the safe default.
    #[default]
    Mutex,
    /// A try-lock spin; trades CPU for latency on hot connections.
    LowLatency,
}

/// Credentials for the challenge-response authentication handshake.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
    database: String,
}

impl Credentials {
    /// Creates credentials against the `admin` database.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::for_database(username, password, "admin")
    }

    /// Creates credentials against a specific database.
    pub fn for_database(
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            database: database.into(),
        }
    }

    /// Returns the user name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Returns the authentication database.
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The password never reaches logs.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("database", &self.database)
            .finish()
    }
}

/// Main client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    servers: Vec<String>,
    auto_discover_servers: bool,
    max_pending_per_connection: usize,
    read_timeout: Duration,
    connect_timeout: Duration,
    max_idle_tick_count: u32,
    reconnect_timeout: Option<Duration>,
    ping_interval: Duration,
    primary_confirmations: usize,
    executor: Option<Arc<dyn TaskExecutor>>,
    lock_type: LockType,
    credentials: Option<Credentials>,
    default_durability: Durability,
    default_read_preference: ReadPreference,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the seed endpoint list.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Returns true if seeds are expanded via identity replies.
    pub fn auto_discover_servers(&self) -> bool {
        self.auto_discover_servers
    }

    /// Returns the bound on the pending-message queue.
    pub fn max_pending_per_connection(&self) -> usize {
        self.max_pending_per_connection
    }

    /// Returns the socket read timeout, which is also the idle-tick
    /// unit.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Returns the bound on TCP connect.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the number of idle ticks tolerated before a graceful
    /// shutdown.
    pub fn max_idle_tick_count(&self) -> u32 {
        self.max_idle_tick_count
    }

    /// Returns the deadline for the replica-set reconnect quorum, if
    /// bounded.
    pub fn reconnect_timeout(&self) -> Option<Duration> {
        self.reconnect_timeout
    }

    /// Returns the pinger sweep interval.
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Returns the number of distinct members that must confirm a new
    /// primary.
    pub fn primary_confirmations(&self) -> usize {
        self.primary_confirmations
    }

    /// Returns the executor for non-lightweight callbacks, if any.
    pub fn executor(&self) -> Option<&Arc<dyn TaskExecutor>> {
        self.executor.as_ref()
    }

    /// Returns the pending-queue synchronization variant.
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Returns the configured credentials, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Returns the default durability for writes.
    pub fn default_durability(&self) -> &Durability {
        &self.default_durability
    }

    /// Returns the default read preference.
    pub fn default_read_preference(&self) -> &ReadPreference {
        &self.default_read_preference
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build().unwrap()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    servers: Vec<String>,
    auto_discover_servers: Option<bool>,
    max_pending_per_connection: Option<usize>,
    read_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    max_idle_tick_count: Option<u32>,
    reconnect_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    primary_confirmations: Option<usize>,
    executor: Option<Arc<dyn TaskExecutor>>,
    lock_type: Option<LockType>,
    credentials: Option<Credentials>,
    default_durability: Option<Durability>,
    default_read_preference: Option<ReadPreference>,
}

impl ClientConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a seed endpoint in `host:port` form.
    pub fn add_server(mut self, server: impl Into<String>) -> Self {
        self.servers.push(server.into());
        self
    }

    /// Sets the seed endpoints, replacing any previously configured.
    pub fn servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Sets whether seeds are expanded via identity replies.
    pub fn auto_discover_servers(mut self, enabled: bool) -> Self {
        self.auto_discover_servers = Some(enabled);
        self
    }

    /// Bounds the pending-message queue per connection.
    pub fn max_pending_per_connection(mut self, bound: usize) -> Self {
        self.max_pending_per_connection = Some(bound);
        self
    }

    /// Sets the socket read timeout (and the idle-tick unit).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Bounds TCP connect attempts.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the number of idle ticks before a graceful shutdown.
    pub fn max_idle_tick_count(mut self, count: u32) -> Self {
        self.max_idle_tick_count = Some(count);
        self
    }

    /// Bounds the replica-set reconnect quorum search.
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = Some(timeout);
        self
    }

    /// Sets the pinger sweep interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Sets the primary confirmation quorum.
    pub fn primary_confirmations(mut self, confirmations: usize) -> Self {
        self.primary_confirmations = Some(confirmations);
        self
    }

    /// Off-loads non-lightweight callbacks to the given executor.
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Selects the pending-queue synchronization variant.
    pub fn lock_type(mut self, lock_type: LockType) -> Self {
        self.lock_type = Some(lock_type);
        self
    }

    /// Enables the authenticating wrapper factory.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the default durability for writes.
    pub fn default_durability(mut self, durability: Durability) -> Self {
        self.default_durability = Some(durability);
        self
    }

    /// Sets the default read preference.
    pub fn default_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.default_read_preference = Some(read_preference);
        self
    }

    /// Builds the configuration, validating option combinations.
    pub fn build(self) -> Result<ClientConfig> {
        let servers = if self.servers.is_empty() {
            vec![DEFAULT_SERVER.to_string()]
        } else {
            self.servers
        };

        for server in &servers {
            if server.is_empty() {
                return Err(Error::Config("server endpoint must not be empty".to_string()));
            }
        }

        let max_pending = self
            .max_pending_per_connection
            .unwrap_or(DEFAULT_MAX_PENDING_PER_CONNECTION);
        if max_pending == 0 {
            return Err(Error::Config(
                "max_pending_per_connection must be at least 1".to_string(),
            ));
        }

        let read_timeout = self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT);
        if read_timeout.is_zero() {
            return Err(Error::Config("read_timeout must be non-zero".to_string()));
        }

        let primary_confirmations = self
            .primary_confirmations
            .unwrap_or(DEFAULT_PRIMARY_CONFIRMATIONS);
        if primary_confirmations == 0 {
            return Err(Error::Config(
                "primary_confirmations must be at least 1".to_string(),
            ));
        }

        Ok(ClientConfig {
            servers,
            auto_discover_servers: self.auto_discover_servers.unwrap_or(true),
            max_pending_per_connection: max_pending,
            read_timeout,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            max_idle_tick_count: self
                .max_idle_tick_count
                .unwrap_or(DEFAULT_MAX_IDLE_TICK_COUNT)
                .max(1),
            reconnect_timeout: self.reconnect_timeout,
            ping_interval: self.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            primary_confirmations,
            executor: self.executor,
            lock_type: self.lock_type.unwrap_or_default(),
            credentials: self.credentials,
            default_durability: self.default_durability.unwrap_or_default(),
            default_read_preference: self.default_read_preference.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongolink_core::ReadPreferenceMode;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.servers(), &[DEFAULT_SERVER.to_string()]);
        assert!(config.auto_discover_servers());
        assert_eq!(config.max_pending_per_connection(), 1024);
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
        assert_eq!(config.primary_confirmations(), 2);
        assert_eq!(config.lock_type(), LockType::Mutex);
        assert!(config.executor().is_none());
        assert!(config.credentials().is_none());
        assert!(config.reconnect_timeout().is_none());
        assert_eq!(
            config.default_read_preference().mode(),
            ReadPreferenceMode::Primary
        );
    }

    #[test]
    fn test_builder_round_trip() {
        let config = ClientConfig::builder()
            .add_server("db-a:27017")
            .add_server("db-b:27017")
            .auto_discover_servers(false)
            .max_pending_per_connection(16)
            .read_timeout(Duration::from_millis(250))
            .connect_timeout(Duration::from_secs(2))
            .max_idle_tick_count(4)
            .reconnect_timeout(Duration::from_secs(5))
            .ping_interval(Duration::from_secs(1))
            .primary_confirmations(3)
            .lock_type(LockType::LowLatency)
            .build()
            .unwrap();

        assert_eq!(config.servers().len(), 2);
        assert!(!config.auto_discover_servers());
        assert_eq!(config.max_pending_per_connection(), 16);
        assert_eq!(config.read_timeout(), Duration::from_millis(250));
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_idle_tick_count(), 4);
        assert_eq!(config.reconnect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.ping_interval(), Duration::from_secs(1));
        assert_eq!(config.primary_confirmations(), 3);
        assert_eq!(config.lock_type(), LockType::LowLatency);
    }

    #[test]
    fn test_servers_replaces_previous() {
        let config = ClientConfig::builder()
            .add_server("old:27017")
            .servers(["new-a:27017", "new-b:27017"])
            .build()
            .unwrap();
        assert_eq!(config.servers(), &["new-a:27017", "new-b:27017"]);
    }

    #[test]
    fn test_zero_pending_bound_fails() {
        let result = ClientConfig::builder().max_pending_per_connection(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_read_timeout_fails() {
        let result = ClientConfig::builder()
            .read_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_server_fails() {
        let result = ClientConfig::builder().add_server("").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_confirmations_fails() {
        let result = ClientConfig::builder().primary_confirmations(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("admin", "secret123");
        let text = format!("{credentials:?}");
        assert!(text.contains("admin"));
        assert!(!text.contains("secret123"));
    }

    #[test]
    fn test_config_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClientConfig>();
    }
}
