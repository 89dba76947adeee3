//! # PostgreSQL Change Events Library
//!
//! Captures row-level changes from a PostgreSQL logical replication slot
//! (wal2json output) and fans them out to application handlers.
//!
//! ## Features
//!
//! - Per-key ordering: records are partitioned by primary key, each partition
//!   drains in FIFO order
//! - Shared or isolated queues per table
//! - Backpressure through per-queue soft limits and a shared flow-control latch
//! - At-least-once delivery: a position is confirmed to the server only after
//!   its batch was accepted
//! - Lazy reconnection of the replication connection
//! - Optional Prometheus statistics (`metrics` feature)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pg2events_lib::{load_config_from_env, run_events_app, LoggingHandler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config_from_env()?;
//!     run_events_app(config, |table| Arc::new(LoggingHandler::new(table))).await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod app;
pub mod config;
pub mod env;
pub mod error;
pub mod retry;
pub mod types;

// Distribution
pub mod distributor;
pub mod flow_control;
pub mod handler;
pub mod holder;
pub mod partition;
pub mod queue;
pub mod statistics;

// Replication
pub mod channel;
pub mod connection;
pub mod decoder;
pub mod producer;
pub mod slot;

// Native replication connection over libpq
#[cfg(feature = "libpq")]
pub mod libpq;

// Monitoring and metrics
pub mod monitoring;

// Public API exports
#[cfg(feature = "libpq")]
pub use app::run_events_app;
pub use app::EventsApp;
pub use channel::{ReplicationChannel, StreamOptions};
pub use config::{Config, ConfigBuilder};
pub use connection::PostgresCatalog;
pub use decoder::{MessageDecoder, Wal2JsonDecoder};
pub use distributor::{BatchSink, DistributorOptions, EventDistributor};
pub use env::load_config_from_env;
pub use error::{EventsError, Result};
pub use flow_control::{FlowControlLatch, LimitObserver, SoftLimitObserver};
pub use handler::{EventHandler, FnHandler, LoggingHandler};
pub use holder::{EventQueueHolder, HolderOptions, QueueMode};
#[cfg(feature = "libpq")]
pub use libpq::LibpqConnector;
pub use partition::{
    PartitionResolver, PrimaryKeyProvider, PrimaryKeyResolver, SinglePartitionResolver,
    StaticPrimaryKeyProvider,
};
pub use producer::ChangeCaptureProducer;
pub use retry::RetryConfig;
pub use slot::{ReplicationConnection, ReplicationConnector, SlotCatalog, SlotConnection, WalData};
pub use statistics::{NoopStatistics, ProducerStatistics, QueueLocation, QueueStatistics};
pub use types::{ChangeBatch, ChangeKind, ChangeRecord, Lsn, ReplicationEvent, RowImage};
