//! Prometheus statistics for queue and producer activity
//!
//! Metrics live in the default prometheus registry; [`gather_metrics`] renders
//! them in the text exposition format.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec,
    Histogram, HistogramVec,
};
use std::time::Duration;

use crate::statistics::{ProducerStatistics, QueueLocation, QueueStatistics};
use crate::types::{ChangeBatch, ChangeRecord};

lazy_static! {
    // =============================================================================
    // Queue Metrics
    // =============================================================================

    /// Records accepted by a queue
    pub static ref RECORDS_ADDED_TOTAL: CounterVec = register_counter_vec!(
        "pg2events_records_added_total",
        "Number of change records enqueued",
        &["table_name", "change_kind"]
    ).expect("metric can be created");

    /// Records completed by every handler of their queue
    pub static ref RECORDS_HANDLED_TOTAL: CounterVec = register_counter_vec!(
        "pg2events_records_handled_total",
        "Number of change records handled",
        &["table_name"]
    ).expect("metric can be created");

    /// Records waiting per partition
    pub static ref QUEUE_LENGTH: GaugeVec = register_gauge_vec!(
        "pg2events_queue_length",
        "Number of records waiting in a partition queue",
        &["table_name", "partition"]
    ).expect("metric can be created");

    /// Handler invocations by outcome
    pub static ref HANDLER_INVOCATIONS_TOTAL: CounterVec = register_counter_vec!(
        "pg2events_handler_invocations_total",
        "Number of handler invocations by outcome",
        &["table_name", "handler", "outcome"]
    ).expect("metric can be created");

    /// Handler duration histogram
    pub static ref HANDLER_DURATION: HistogramVec = register_histogram_vec!(
        "pg2events_handler_duration_seconds",
        "Time taken by a handler for one record",
        &["table_name", "handler"]
    ).expect("metric can be created");

    // =============================================================================
    // Producer Metrics
    // =============================================================================

    /// 1 while the producer loop runs
    pub static ref PRODUCER_RUNNING: Gauge = register_gauge!(
        "pg2events_producer_running",
        "Whether the change capture producer is running"
    ).expect("metric can be created");

    pub static ref EVENTS_RECEIVED_TOTAL: Counter = register_counter!(
        "pg2events_events_received_total",
        "Number of replication messages received"
    ).expect("metric can be created");

    pub static ref EVENTS_HANDLED_TOTAL: Counter = register_counter!(
        "pg2events_events_handled_total",
        "Number of replication messages distributed and committed"
    ).expect("metric can be created");

    /// Time between reading a message and handing its batch off
    pub static ref EVENT_DISTRIBUTION_DURATION: Histogram = register_histogram!(
        "pg2events_event_distribution_duration_seconds",
        "Time from reading a replication message until its batch was accepted"
    ).expect("metric can be created");
}

/// Statistics sink exporting to Prometheus
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusStatistics;

impl PrometheusStatistics {
    pub fn new() -> Self {
        Self
    }
}

impl QueueStatistics for PrometheusStatistics {
    fn record_added(&self, location: QueueLocation<'_>, _at: DateTime<Utc>, record: &ChangeRecord) {
        let kind = record.kind.to_string();
        RECORDS_ADDED_TOTAL
            .with_label_values(&[location.table, &kind])
            .inc();
        QUEUE_LENGTH
            .with_label_values(&[location.table, &location.partition.to_string()])
            .inc();
    }

    fn record_polled(&self, location: QueueLocation<'_>, _at: DateTime<Utc>, _record: &ChangeRecord) {
        QUEUE_LENGTH
            .with_label_values(&[location.table, &location.partition.to_string()])
            .dec();
    }

    fn handler_completed(
        &self,
        location: QueueLocation<'_>,
        handler: &str,
        duration: Duration,
        success: bool,
        _record: &ChangeRecord,
    ) {
        let outcome = if success { "success" } else { "failure" };
        HANDLER_INVOCATIONS_TOTAL
            .with_label_values(&[location.table, handler, outcome])
            .inc();
        HANDLER_DURATION
            .with_label_values(&[location.table, handler])
            .observe(duration.as_secs_f64());
    }

    fn record_handled(&self, location: QueueLocation<'_>, _at: DateTime<Utc>, _record: &ChangeRecord) {
        RECORDS_HANDLED_TOTAL
            .with_label_values(&[location.table])
            .inc();
    }
}

impl ProducerStatistics for PrometheusStatistics {
    fn producer_running(&self) {
        PRODUCER_RUNNING.set(1.0);
    }

    fn producer_stopped(&self) {
        PRODUCER_RUNNING.set(0.0);
    }

    fn event_received(&self) {
        EVENTS_RECEIVED_TOTAL.inc();
    }

    fn event_handled(&self, _batch: &ChangeBatch, read_time: DateTime<Utc>) {
        EVENTS_HANDLED_TOTAL.inc();
        let elapsed = Utc::now().signed_duration_since(read_time);
        if let Ok(elapsed) = elapsed.to_std() {
            EVENT_DISTRIBUTION_DURATION.observe(elapsed.as_secs_f64());
        }
    }
}

/// Gather all metrics from the default registry
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let metric_families = prometheus::gather();
    let encoder = prometheus::TextEncoder::new();
    let mut output = Vec::new();
    encoder.encode(&metric_families, &mut output)?;
    Ok(String::from_utf8(output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowImage;

    #[test]
    fn test_statistics_are_exported() {
        let stats = PrometheusStatistics::new();
        let record = ChangeRecord::insert("metrics_orders", RowImage::new().with("id", "1"));
        let location = QueueLocation {
            table: "metrics_orders",
            partition: 0,
            handler: None,
        };

        stats.record_added(location, Utc::now(), &record);
        stats.handler_completed(location, "audit", Duration::from_millis(3), false, &record);
        stats.record_polled(location, Utc::now(), &record);
        stats.record_handled(location, Utc::now(), &record);
        stats.event_received();

        let text = gather_metrics().unwrap();
        assert!(text.contains("pg2events_records_added_total"));
        assert!(text.contains("metrics_orders"));
        assert!(text.contains("outcome=\"failure\""));
        assert!(text.contains("pg2events_events_received_total"));
    }
}
