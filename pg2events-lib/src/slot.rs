//! Replication connection management
//!
//! [`SlotConnection`] owns the raw replication connection. Failures anywhere in
//! the pipeline only mark it invalid; the next [`SlotConnection::get_connection`]
//! replaces it and tells every subscriber that streams bound to the old
//! connection are gone.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{EventsError, Result};
use crate::types::Lsn;

/// Payload of one XLogData message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub payload: Bytes,
}

/// A replication-protocol connection to the server
#[async_trait]
pub trait ReplicationConnection: Send {
    /// Issues `START_REPLICATION SLOT .. LOGICAL` with plugin options
    ///
    /// `None` starts at the slot's confirmed position.
    async fn start_logical_stream(
        &mut self,
        slot: &str,
        start: Option<Lsn>,
        options: &[(String, String)],
    ) -> Result<()>;

    /// Reads at most one data message, waiting no longer than `window`
    async fn read_pending(&mut self, window: Duration) -> Result<Option<WalData>>;

    /// Sends a standby status update and asks for no reply
    async fn send_status(&mut self, received: Lsn, flushed: Lsn, applied: Lsn) -> Result<()>;

    fn is_closed(&self) -> bool;

    async fn create_logical_slot(&mut self, slot: &str, plugin: &str) -> Result<()>;

    async fn drop_slot(&mut self, slot: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens replication connections
#[async_trait]
pub trait ReplicationConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ReplicationConnection>>;
}

/// Slot lookups over an ordinary SQL connection
#[async_trait]
pub trait SlotCatalog: Send + Sync {
    async fn slot_exists(&self, slot: &str) -> Result<bool>;
}

/// Callback run after every reconnect
pub type ReconnectSubscriber = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Lazily reconnecting holder of the replication connection
pub struct SlotConnection {
    connector: Arc<dyn ReplicationConnector>,
    connection: Option<Box<dyn ReplicationConnection>>,
    invalid: AtomicBool,
    subscribers: Vec<(SubscriptionId, ReconnectSubscriber)>,
    next_subscription: u64,
}

impl SlotConnection {
    pub fn new(connector: Arc<dyn ReplicationConnector>) -> Self {
        Self {
            connector,
            connection: None,
            invalid: AtomicBool::new(false),
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Returns a usable connection, reconnecting when forced, invalid or closed
    pub async fn get_connection(
        &mut self,
        force_reconnect: bool,
    ) -> Result<&mut (dyn ReplicationConnection + 'static)> {
        let stale = force_reconnect
            || self.invalid.load(Ordering::Acquire)
            || self.connection.as_ref().map_or(true, |c| c.is_closed());

        if stale {
            self.close_current().await;

            let connection = self.connector.connect().await.map_err(|e| match e {
                EventsError::Connection(_) => e,
                other => EventsError::connection(format!(
                    "Failed to open replication connection: {}",
                    other
                )),
            })?;
            self.connection = Some(connection);
            self.invalid.store(false, Ordering::Release);

            info!("Replication connection established");
            for (_, subscriber) in &self.subscribers {
                subscriber();
            }
        }

        match self.connection.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(EventsError::connection("Replication connection unavailable")),
        }
    }

    /// Marks the connection for replacement on next use
    pub fn invalidate(&self) {
        if !self.invalid.swap(true, Ordering::AcqRel) {
            debug!("Replication connection invalidated");
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn register_subscriber(&mut self, subscriber: ReconnectSubscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, subscriber));
        id
    }

    pub fn unregister_subscriber(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    /// Closes the live connection, the next use reconnects
    pub async fn close(&mut self) {
        self.close_current().await;
    }

    async fn close_current(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!("Error while closing replication connection: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Dummy {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ReplicationConnection for Dummy {
        async fn start_logical_stream(&mut self, _: &str, _: Option<Lsn>, _: &[(String, String)]) -> Result<()> {
            Ok(())
        }

        async fn read_pending(&mut self, _: Duration) -> Result<Option<WalData>> {
            Ok(None)
        }

        async fn send_status(&mut self, _: Lsn, _: Lsn, _: Lsn) -> Result<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn create_logical_slot(&mut self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn drop_slot(&mut self, _: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct DummyConnector {
        opened: AtomicUsize,
        fail: AtomicBool,
        last_closed: std::sync::Mutex<Option<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl ReplicationConnector for DummyConnector {
        async fn connect(&self) -> Result<Box<dyn ReplicationConnection>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EventsError::protocol("server went away"));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::new(AtomicBool::new(false));
            *self.last_closed.lock().unwrap() = Some(closed.clone());
            Ok(Box::new(Dummy { closed }))
        }
    }

    #[tokio::test]
    async fn test_reconnects_only_when_needed() {
        let connector = Arc::new(DummyConnector::default());
        let mut slot = SlotConnection::new(connector.clone());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        slot.register_subscriber(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        slot.get_connection(false).await.unwrap();
        slot.get_connection(false).await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        slot.invalidate();
        slot.get_connection(false).await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert!(!slot.is_invalid());

        slot.get_connection(true).await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 3);
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let connector = Arc::new(DummyConnector::default());
        let mut slot = SlotConnection::new(connector.clone());
        slot.get_connection(false).await.unwrap();

        let closed = connector.last_closed.lock().unwrap().clone().unwrap();
        closed.store(true, Ordering::SeqCst);
        slot.get_connection(false).await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_failure_is_connection_error() {
        let connector = Arc::new(DummyConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let mut slot = SlotConnection::new(connector);
        let err = slot.get_connection(false).await.err().unwrap();
        assert!(matches!(err, EventsError::Connection(_)));
    }

    #[tokio::test]
    async fn test_unregistered_subscriber_is_not_called() {
        let connector = Arc::new(DummyConnector::default());
        let mut slot = SlotConnection::new(connector);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let id = slot.register_subscriber(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(slot.unregister_subscriber(id));
        slot.get_connection(false).await.unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }
}
