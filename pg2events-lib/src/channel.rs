//! Logical replication channel bound to one slot
//!
//! The channel (re)starts the wal2json stream whenever the underlying
//! connection was replaced, reads one message at a time and confirms
//! positions back to the server. The server-side slot is the only durable
//! checkpoint; the resume hint only lets a recreated stream skip messages that
//! were already handled.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{EventsError, Result};
use crate::slot::{ReplicationConnection, ReplicationConnector, SlotCatalog, SlotConnection};
use crate::types::{Lsn, ReplicationEvent};

pub const DEFAULT_PLUGIN: &str = "wal2json";
pub const DEFAULT_READ_WINDOW: Duration = Duration::from_millis(100);

/// Stream settings of a channel
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub slot_name: String,
    pub plugin: String,
    /// `schema.table` filter passed as `add-tables`, empty for all tables
    pub tables: Vec<String>,
    /// Longest wait for a pending message in `receive`
    pub read_window: Duration,
}

impl StreamOptions {
    pub fn new(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            plugin: DEFAULT_PLUGIN.to_string(),
            tables: Vec::new(),
            read_window: DEFAULT_READ_WINDOW,
        }
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }

    pub fn with_read_window(mut self, read_window: Duration) -> Self {
        self.read_window = read_window;
        self
    }

    /// Plugin options sent with `START_REPLICATION`
    pub fn plugin_options(&self) -> Vec<(String, String)> {
        let mut options = vec![
            ("include-xids".to_string(), "true".to_string()),
            ("include-timestamp".to_string(), "true".to_string()),
            ("include-lsn".to_string(), "true".to_string()),
            ("include-types".to_string(), "false".to_string()),
        ];
        if !self.tables.is_empty() {
            options.push(("add-tables".to_string(), self.tables.join(",")));
        }
        options
    }
}

/// Replication stream over a [`SlotConnection`]
pub struct ReplicationChannel {
    connection: SlotConnection,
    catalog: Arc<dyn SlotCatalog>,
    options: StreamOptions,
    plugin_options: Vec<(String, String)>,
    stream_started: bool,
    stream_stale: Arc<AtomicBool>,
    resume_hint: Option<Lsn>,
    last_received: Lsn,
}

impl ReplicationChannel {
    pub fn new(
        connector: Arc<dyn ReplicationConnector>,
        catalog: Arc<dyn SlotCatalog>,
        options: StreamOptions,
    ) -> Self {
        let mut connection = SlotConnection::new(connector);
        let stream_stale = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&stream_stale);
        connection.register_subscriber(Arc::new(move || {
            flag.store(true, Ordering::Release);
        }));
        let plugin_options = options.plugin_options();

        Self {
            connection,
            catalog,
            options,
            plugin_options,
            stream_started: false,
            stream_stale,
            resume_hint: None,
            last_received: Lsn::INVALID,
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.options.slot_name
    }

    /// Position the next recreated stream starts from
    pub fn resume_hint(&self) -> Option<Lsn> {
        self.resume_hint
    }

    pub fn last_received(&self) -> Lsn {
        self.last_received
    }

    /// Current connection with a started stream, recreating either as needed
    async fn stream(&mut self) -> Result<&mut (dyn ReplicationConnection + 'static)> {
        let connection = self.connection.get_connection(false).await?;

        if self.stream_stale.swap(false, Ordering::AcqRel) || !self.stream_started {
            let start = self.resume_hint.filter(|lsn| lsn.is_valid());
            self.stream_started = false;
            connection
                .start_logical_stream(&self.options.slot_name, start, &self.plugin_options)
                .await?;
            self.stream_started = true;
            match start {
                Some(lsn) => info!(
                    "Started replication stream on slot '{}' at {}",
                    self.options.slot_name, lsn
                ),
                None => info!(
                    "Started replication stream on slot '{}' at confirmed position",
                    self.options.slot_name
                ),
            }
        }
        Ok(connection)
    }

    async fn try_receive(&mut self) -> Result<Option<ReplicationEvent>> {
        let window = self.options.read_window;
        let stream = self.stream().await?;
        let Some(data) = stream.read_pending(window).await? else {
            return Ok(None);
        };

        if data.wal_start > self.last_received {
            self.last_received = data.wal_start;
        }
        Ok(Some(ReplicationEvent {
            message: String::from_utf8_lossy(&data.payload).into_owned(),
            read_time: Utc::now(),
            received_position: data.wal_start,
        }))
    }

    /// One non-blocking read; failures invalidate the connection and yield `None`
    pub async fn receive(&mut self) -> Option<ReplicationEvent> {
        match self.try_receive().await {
            Ok(event) => event,
            Err(e) => {
                info!("Failed to read from replication stream: {}", e);
                self.stream_started = false;
                self.connection.invalidate();
                None
            }
        }
    }

    /// Confirms `received` as flushed and applied
    ///
    /// `resume_hint` replaces the start position of the next recreated stream.
    /// Returns `false` when the status update could not be pushed.
    pub async fn commit(&mut self, received: Lsn, resume_hint: Option<Lsn>) -> bool {
        if let Some(hint) = resume_hint {
            self.resume_hint = Some(hint);
        }
        if received > self.last_received {
            self.last_received = received;
        }
        let last_received = self.last_received;

        let stream = match self.stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot obtain replication stream to commit {}: {}", received, e);
                self.stream_started = false;
                self.connection.invalidate();
                return false;
            }
        };

        match stream.send_status(last_received, received, received).await {
            Ok(()) => {
                debug!("Committed position {}", received);
                true
            }
            Err(e) => {
                error!("Failed to push status update for {}: {}", received, e);
                self.stream_started = false;
                self.connection.invalidate();
                false
            }
        }
    }

    /// Drops the connection so uncommitted messages are redelivered
    pub fn reset_uncommitted(&mut self) {
        self.stream_started = false;
        self.connection.invalidate();
    }

    pub async fn slot_exists(&mut self) -> Result<bool> {
        self.catalog.slot_exists(&self.options.slot_name).await
    }

    /// Creates the slot unless it already exists
    pub async fn create_slot(&mut self) -> Result<()> {
        if self.slot_exists().await? {
            debug!("Replication slot '{}' already exists", self.options.slot_name);
            return Ok(());
        }

        // A streaming connection does not accept replication commands
        let force = self.stream_started;
        self.stream_started = false;
        let connection = self.connection.get_connection(force).await?;
        match connection
            .create_logical_slot(&self.options.slot_name, &self.options.plugin)
            .await
        {
            Ok(()) => {
                info!(
                    "Created replication slot '{}' with plugin '{}'",
                    self.options.slot_name, self.options.plugin
                );
                Ok(())
            }
            Err(e) => {
                self.connection.invalidate();
                Err(EventsError::replication_slot(format!(
                    "Failed to create slot '{}': {}",
                    self.options.slot_name, e
                )))
            }
        }
    }

    /// Closes the stream and drops the slot if it exists
    pub async fn drop_slot(&mut self) -> Result<()> {
        if !self.slot_exists().await? {
            debug!("Replication slot '{}' does not exist", self.options.slot_name);
            return Ok(());
        }

        self.stream_started = false;
        self.connection.close().await;
        let connection = self.connection.get_connection(true).await?;
        match connection.drop_slot(&self.options.slot_name).await {
            Ok(()) => {
                info!("Dropped replication slot '{}'", self.options.slot_name);
                Ok(())
            }
            Err(e) => {
                self.connection.invalidate();
                Err(EventsError::replication_slot(format!(
                    "Failed to drop slot '{}': {}",
                    self.options.slot_name, e
                )))
            }
        }
    }

    pub async fn close(&mut self) {
        self.stream_started = false;
        self.connection.close().await;
    }
}
