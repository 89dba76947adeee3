//! Shared test utilities for pg2events-lib integration tests.
//!
//! `MockServer` plays both the replication server and the catalog: it keeps a
//! WAL log, replays everything past the confirmed position to each new stream
//! and records every connect, stream start and status update.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pg2events_lib::{
    ChangeBatch, ChangeRecord, EventHandler, EventsError, Lsn, ProducerStatistics, QueueLocation,
    QueueStatistics, ReplicationChannel, ReplicationConnection, ReplicationConnector, Result,
    SlotCatalog, StreamOptions, WalData,
};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Default)]
pub struct ServerState {
    pub log: Vec<(Lsn, String)>,
    pub confirmed: Lsn,
    pub statuses: Vec<(Lsn, Lsn, Lsn)>,
    pub starts: Vec<Option<Lsn>>,
    pub connects: usize,
    pub slots: HashSet<String>,
    pub fail_reads: usize,
    pub fail_status: bool,
    pub fail_connect: bool,
}

#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(self, slot: &str) -> Self {
        self.state().slots.insert(slot.to_string());
        self
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Appends a message to the WAL at `lsn`
    pub fn push(&self, lsn: u64, message: impl Into<String>) {
        self.state().log.push((Lsn(lsn), message.into()));
    }

    pub fn statuses(&self) -> Vec<(Lsn, Lsn, Lsn)> {
        self.state().statuses.clone()
    }

    pub fn flushed(&self) -> Vec<Lsn> {
        self.state().statuses.iter().map(|(_, f, _)| *f).collect()
    }

    pub fn starts(&self) -> Vec<Option<Lsn>> {
        self.state().starts.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn confirmed(&self) -> Lsn {
        self.state().confirmed
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        self.state().slots.contains(slot)
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.state().fail_reads = count;
    }
}

#[async_trait]
impl ReplicationConnector for MockServer {
    async fn connect(&self) -> Result<Box<dyn ReplicationConnection>> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(EventsError::connection("connection refused"));
        }
        state.connects += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            stream: None,
            closed: false,
        }))
    }
}

#[async_trait]
impl SlotCatalog for MockServer {
    async fn slot_exists(&self, slot: &str) -> Result<bool> {
        Ok(self.has_slot(slot))
    }
}

struct StreamCursor {
    after: Lsn,
    from: Option<Lsn>,
    next: usize,
}

pub struct MockConnection {
    state: Arc<Mutex<ServerState>>,
    stream: Option<StreamCursor>,
    closed: bool,
}

#[async_trait]
impl ReplicationConnection for MockConnection {
    async fn start_logical_stream(
        &mut self,
        slot: &str,
        start: Option<Lsn>,
        _options: &[(String, String)],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.slots.contains(slot) {
            return Err(EventsError::replication_slot(format!(
                "replication slot \"{}\" does not exist",
                slot
            )));
        }
        state.starts.push(start);
        self.stream = Some(StreamCursor {
            after: state.confirmed,
            from: start,
            next: 0,
        });
        Ok(())
    }

    async fn read_pending(&mut self, _window: Duration) -> Result<Option<WalData>> {
        if self.closed {
            return Err(EventsError::connection("connection closed"));
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(EventsError::protocol("unexpected EOF on replication connection"));
        }
        let Some(cursor) = self.stream.as_mut() else {
            return Err(EventsError::protocol("no replication stream started"));
        };

        while cursor.next < state.log.len() {
            let (lsn, message) = &state.log[cursor.next];
            cursor.next += 1;
            if *lsn > cursor.after && cursor.from.map_or(true, |from| *lsn >= from) {
                return Ok(Some(WalData {
                    wal_start: *lsn,
                    wal_end: *lsn,
                    payload: Bytes::from(message.clone()),
                }));
            }
        }
        Ok(None)
    }

    async fn send_status(&mut self, received: Lsn, flushed: Lsn, applied: Lsn) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_status {
            return Err(EventsError::connection("broken pipe"));
        }
        state.statuses.push((received, flushed, applied));
        if flushed > state.confirmed {
            state.confirmed = flushed;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn create_logical_slot(&mut self, slot: &str, _plugin: &str) -> Result<()> {
        self.state.lock().unwrap().slots.insert(slot.to_string());
        Ok(())
    }

    async fn drop_slot(&mut self, slot: &str) -> Result<()> {
        self.state.lock().unwrap().slots.remove(slot);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Channel over `server` with a short read window
pub fn channel(server: &MockServer, slot: &str) -> ReplicationChannel {
    ReplicationChannel::new(
        Arc::new(server.clone()),
        Arc::new(server.clone()),
        StreamOptions::new(slot).with_read_window(Duration::from_millis(10)),
    )
}

/// One wal2json change entry with columns `id` and `value`
pub fn change(kind: &str, table: &str, id: &str, value: &str) -> Value {
    json!({
        "kind": kind,
        "schema": "public",
        "table": table,
        "columnnames": ["id", "value"],
        "columnvalues": [id, value],
    })
}

/// One wal2json transaction message
pub fn transaction(nextlsn: &str, changes: Vec<Value>) -> String {
    json!({
        "xid": 1000,
        "nextlsn": nextlsn,
        "timestamp": "2024-05-01 10:00:00.000000+00",
        "change": changes,
    })
    .to_string()
}

pub fn keep_alive() -> String {
    r#"{"xid":1001,"change":[]}"#.to_string()
}

/// Handler remembering every record it saw
pub struct RecordingHandler {
    name: String,
    records: Mutex<Vec<ChangeRecord>>,
    delay: Duration,
    fail: bool,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, Duration::ZERO, false, None))
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name, delay, false, None))
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, Duration::ZERO, true, None))
    }

    /// Handler that takes one permit of the returned semaphore per record
    pub fn gated(name: &str) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(Self::build(name, Duration::ZERO, false, Some(gate.clone())));
        (handler, gate)
    }

    fn build(name: &str, delay: Duration, fail: bool, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(Vec::new()),
            delay,
            fail,
            gate,
        }
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// `value` column of every record whose `id` is `id`, in arrival order
    pub fn values_for(&self, id: &str) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| r.after.as_ref())
            .filter(|row| row.get("id") == Some(Some(id)))
            .filter_map(|row| row.get("value").flatten().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, record: &ChangeRecord) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map(|permit| permit.forget())
                .map_err(|_| EventsError::handler("gate closed"))?;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.records.lock().unwrap().push(record.clone());
        if self.fail {
            return Err(EventsError::handler("rejected by test handler"));
        }
        Ok(())
    }
}

/// Statistics sink counting every callback
#[derive(Default)]
pub struct RecordingStatistics {
    pub added: Mutex<Vec<(String, usize)>>,
    pub polled: AtomicUsize,
    pub handled: AtomicUsize,
    pub handler_successes: AtomicUsize,
    pub handler_failures: AtomicUsize,
    pub running: AtomicBool,
    pub stopped: AtomicUsize,
    pub received: AtomicUsize,
    pub events_handled: AtomicUsize,
}

impl RecordingStatistics {
    /// Partitions of `table` that received at least one record
    pub fn partitions(&self, table: &str) -> BTreeSet<usize> {
        self.added
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, partition)| *partition)
            .collect()
    }
}

impl QueueStatistics for RecordingStatistics {
    fn record_added(&self, location: QueueLocation<'_>, _at: DateTime<Utc>, _record: &ChangeRecord) {
        self.added
            .lock()
            .unwrap()
            .push((location.table.to_string(), location.partition));
    }

    fn record_polled(&self, _location: QueueLocation<'_>, _at: DateTime<Utc>, _record: &ChangeRecord) {
        self.polled.fetch_add(1, Ordering::SeqCst);
    }

    fn handler_completed(
        &self,
        _location: QueueLocation<'_>,
        _handler: &str,
        _duration: Duration,
        success: bool,
        _record: &ChangeRecord,
    ) {
        if success {
            self.handler_successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.handler_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_handled(&self, _location: QueueLocation<'_>, _at: DateTime<Utc>, _record: &ChangeRecord) {
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

impl ProducerStatistics for RecordingStatistics {
    fn producer_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn producer_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn event_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn event_handled(&self, _batch: &ChangeBatch, _read_time: DateTime<Utc>) {
        self.events_handled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Routes library logs to the test output, honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or `timeout` elapses
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
