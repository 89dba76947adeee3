//! Statistics observers
//!
//! Pass-through callbacks for queue and producer activity. Nothing returned by a
//! sink influences delivery.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::types::{ChangeBatch, ChangeRecord};

/// Identifies the queue that reported an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLocation<'a> {
    pub table: &'a str,
    pub partition: usize,
    /// Handler bound to the queue, `None` for shared queues
    pub handler: Option<&'a str>,
}

/// Queue-level events
#[allow(unused_variables)]
pub trait QueueStatistics: Send + Sync {
    fn record_added(&self, location: QueueLocation<'_>, at: DateTime<Utc>, record: &ChangeRecord) {}

    fn record_polled(&self, location: QueueLocation<'_>, at: DateTime<Utc>, record: &ChangeRecord) {}

    /// One handler finished one record
    fn handler_completed(
        &self,
        location: QueueLocation<'_>,
        handler: &str,
        duration: Duration,
        success: bool,
        record: &ChangeRecord,
    ) {
    }

    /// All handlers of the queue finished the record
    fn record_handled(&self, location: QueueLocation<'_>, at: DateTime<Utc>, record: &ChangeRecord) {}
}

/// Producer-level events
#[allow(unused_variables)]
pub trait ProducerStatistics: Send + Sync {
    fn producer_running(&self) {}

    fn producer_stopped(&self) {}

    fn event_received(&self) {}

    fn event_handled(&self, batch: &ChangeBatch, read_time: DateTime<Utc>) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatistics;

impl QueueStatistics for NoopStatistics {}

impl ProducerStatistics for NoopStatistics {}

/// Queue statistics bound to one queue
#[derive(Clone)]
pub struct QueueStatisticsScope {
    table: String,
    partition: usize,
    handler: Option<String>,
    sink: Arc<dyn QueueStatistics>,
}

impl QueueStatisticsScope {
    pub fn new(
        table: impl Into<String>,
        partition: usize,
        handler: Option<String>,
        sink: Arc<dyn QueueStatistics>,
    ) -> Self {
        Self {
            table: table.into(),
            partition,
            handler,
            sink,
        }
    }

    pub fn location(&self) -> QueueLocation<'_> {
        QueueLocation {
            table: &self.table,
            partition: self.partition,
            handler: self.handler.as_deref(),
        }
    }

    pub fn added(&self, record: &ChangeRecord) {
        self.sink.record_added(self.location(), Utc::now(), record);
    }

    pub fn polled(&self, record: &ChangeRecord) {
        self.sink.record_polled(self.location(), Utc::now(), record);
    }

    pub fn handler_completed(&self, handler: &str, duration: Duration, success: bool, record: &ChangeRecord) {
        self.sink
            .handler_completed(self.location(), handler, duration, success, record);
    }

    pub fn handled(&self, record: &ChangeRecord) {
        self.sink.record_handled(self.location(), Utc::now(), record);
    }
}

impl std::fmt::Debug for QueueStatisticsScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStatisticsScope")
            .field("table", &self.table)
            .field("partition", &self.partition)
            .field("handler", &self.handler)
            .finish()
    }
}
