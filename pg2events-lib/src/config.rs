use crate::error::{EventsError, Result};
use crate::holder::QueueMode;
use std::time::Duration;

/// Configuration for change capture and distribution
#[derive(Debug, Clone)]
pub struct Config {
    /// Replication connection string (`replication=database`)
    pub replication_connection_string: String,

    /// Ordinary connection used for catalog lookups, derived from the
    /// replication connection string when not set
    pub catalog_connection_string: Option<String>,

    /// Replication slot name to create/use
    pub slot_name: String,

    /// Logical decoding output plugin
    pub output_plugin: String,

    /// Tables to capture (`table` or `schema.table`), empty for all
    pub tables: Vec<String>,

    /// Pause of the producer loop when nothing was produced
    pub idle_poll_timeout: Duration,

    /// Longest wait for a pending message per receive
    pub read_window: Duration,

    /// Interval of unsolicited standby status updates
    pub status_interval: Duration,

    /// Longest wait on backpressure before a batch is rejected
    pub backpressure_timeout: Duration,

    /// Concurrent batch distributions admitted
    pub distribution_permits: usize,

    /// Partitions per table
    pub default_queue_count: usize,

    /// Queue depth that engages backpressure, 0 disables it
    pub default_soft_limit: usize,

    /// Queue layout per table
    pub default_queue_mode: QueueMode,

    /// Passed as `connect_timeout` to both connections
    pub connection_timeout: Duration,

    /// Maximum number of retry attempts for connection failures
    pub max_retry_attempts: u32,

    /// Initial retry delay (will be increased exponentially)
    pub initial_retry_delay: Duration,

    /// Maximum retry delay between attempts
    pub max_retry_delay: Duration,

    /// Retry multiplier for exponential backoff
    pub retry_multiplier: f64,

    /// Maximum total time to spend retrying before giving up
    pub max_retry_duration: Duration,

    /// Whether to add jitter to retry delays
    pub retry_jitter: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replication_connection_string: String::new(),
            catalog_connection_string: None,
            slot_name: "pg2events_slot".to_string(),
            output_plugin: "wal2json".to_string(),
            tables: Vec::new(),
            idle_poll_timeout: Duration::from_millis(500),
            read_window: Duration::from_millis(100),
            status_interval: Duration::from_secs(15),
            backpressure_timeout: Duration::from_secs(30),
            distribution_permits: 10,
            default_queue_count: 1,
            default_soft_limit: 1000,
            default_queue_mode: QueueMode::Shared,
            connection_timeout: Duration::from_secs(30),
            max_retry_attempts: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_multiplier: 2.0,
            max_retry_duration: Duration::from_secs(300),
            retry_jitter: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Connection string for catalog queries
    pub fn catalog_connection_string(&self) -> String {
        match &self.catalog_connection_string {
            Some(explicit) => explicit.clone(),
            None => strip_replication_param(&self.replication_connection_string),
        }
    }

    /// Replication connection string with `connect_timeout` applied
    pub fn replication_conninfo(&self) -> String {
        with_connect_timeout(&self.replication_connection_string, self.connection_timeout)
    }

    /// Catalog connection string with `connect_timeout` applied
    pub fn catalog_conninfo(&self) -> String {
        with_connect_timeout(&self.catalog_connection_string(), self.connection_timeout)
    }

    /// Configured tables without their schema prefix
    pub fn table_names(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|t| split_table(t).1.to_string())
            .collect()
    }
}

/// Splits `schema.table` into its parts, `public` when unqualified
pub fn split_table(qualified: &str) -> (&str, &str) {
    match qualified.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("public", qualified),
    }
}

/// Appends `connect_timeout` (whole seconds, at least 1) unless already present
pub fn with_connect_timeout(connection_string: &str, timeout: Duration) -> String {
    if connection_string.contains("connect_timeout=") {
        return connection_string.to_string();
    }
    let secs = timeout.as_secs().max(1);
    if connection_string.contains("://") {
        let separator = if connection_string.contains('?') { '&' } else { '?' };
        format!("{}{}connect_timeout={}", connection_string, separator, secs)
    } else {
        format!("{} connect_timeout={}", connection_string.trim_end(), secs)
    }
}

/// Removes the `replication` parameter from a URI or key/value connection string
pub fn strip_replication_param(connection_string: &str) -> String {
    if connection_string.contains("://") {
        match connection_string.split_once('?') {
            Some((base, query)) => {
                let kept: Vec<&str> = query
                    .split('&')
                    .filter(|pair| !pair.is_empty() && !pair.starts_with("replication="))
                    .collect();
                if kept.is_empty() {
                    base.to_string()
                } else {
                    format!("{}?{}", base, kept.join("&"))
                }
            }
            None => connection_string.to_string(),
        }
    } else {
        connection_string
            .split_whitespace()
            .filter(|pair| !pair.starts_with("replication="))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builder pattern for creating configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new config builder
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the replication connection string
    pub fn replication_connection_string<S: Into<String>>(mut self, connection_string: S) -> Self {
        self.config.replication_connection_string = connection_string.into();
        self
    }

    /// Set the catalog connection string
    pub fn catalog_connection_string<S: Into<String>>(mut self, connection_string: S) -> Self {
        self.config.catalog_connection_string = Some(connection_string.into());
        self
    }

    /// Set the replication slot name
    pub fn slot_name<S: Into<String>>(mut self, slot_name: S) -> Self {
        self.config.slot_name = slot_name.into();
        self
    }

    /// Set the output plugin
    pub fn output_plugin<S: Into<String>>(mut self, plugin: S) -> Self {
        self.config.output_plugin = plugin.into();
        self
    }

    /// Add a table to capture
    pub fn table<S: Into<String>>(mut self, table: S) -> Self {
        self.config.tables.push(table.into());
        self
    }

    /// Set all tables at once
    pub fn tables(mut self, tables: Vec<String>) -> Self {
        self.config.tables = tables;
        self
    }

    pub fn idle_poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_poll_timeout = timeout;
        self
    }

    pub fn read_window(mut self, window: Duration) -> Self {
        self.config.read_window = window;
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.config.status_interval = interval;
        self
    }

    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout = timeout;
        self
    }

    pub fn distribution_permits(mut self, permits: usize) -> Self {
        self.config.distribution_permits = permits;
        self
    }

    pub fn default_queue_count(mut self, count: usize) -> Self {
        self.config.default_queue_count = count;
        self
    }

    pub fn default_soft_limit(mut self, limit: usize) -> Self {
        self.config.default_soft_limit = limit;
        self
    }

    pub fn default_queue_mode(mut self, mode: QueueMode) -> Self {
        self.config.default_queue_mode = mode;
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set maximum number of retry attempts
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    /// Set initial retry delay
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.config.initial_retry_delay = delay;
        self
    }

    /// Set maximum retry delay
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    /// Set retry multiplier for exponential backoff
    pub fn retry_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_multiplier = multiplier;
        self
    }

    /// Set maximum retry duration
    pub fn max_retry_duration(mut self, duration: Duration) -> Self {
        self.config.max_retry_duration = duration;
        self
    }

    /// Enable/disable retry jitter
    pub fn retry_jitter(mut self, enabled: bool) -> Self {
        self.config.retry_jitter = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        self.validate()?;
        Ok(self.config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.config.replication_connection_string.is_empty() {
            return Err(EventsError::config("Replication connection string is required"));
        }

        if self.config.slot_name.is_empty() {
            return Err(EventsError::config("Replication slot name is required"));
        }

        // Slot names are limited to lower case letters, digits and underscores
        if !self
            .config
            .slot_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(EventsError::config(format!(
                "Invalid replication slot name '{}'",
                self.config.slot_name
            )));
        }

        if self.config.output_plugin.is_empty() {
            return Err(EventsError::config("Output plugin is required"));
        }

        if self.config.distribution_permits == 0 {
            return Err(EventsError::config("Distribution permits must be greater than 0"));
        }

        if self.config.default_queue_count == 0 {
            return Err(EventsError::config("Queue count must be greater than 0"));
        }

        if self.config.read_window.is_zero() {
            return Err(EventsError::config("Read window must be greater than 0"));
        }

        if self.config.retry_multiplier < 1.0 {
            return Err(EventsError::config("Retry multiplier must be at least 1.0"));
        }

        Ok(())
    }
}
