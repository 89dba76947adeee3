//! Event distribution
//!
//! [`EventDistributor`] is the single entry point for decoded batches. It caps
//! the number of concurrent `add` calls, waits on the flow-control latch once
//! per batch and routes every record to the holder of its table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::error::{EventsError, Result};
use crate::flow_control::FlowControlLatch;
use crate::handler::EventHandler;
use crate::holder::{build_holder, EventQueueHolder, HolderOptions};
use crate::partition::{PartitionResolver, SinglePartitionResolver};
use crate::statistics::{NoopStatistics, QueueStatistics};
use crate::types::ChangeBatch;

pub const DEFAULT_PERMITS: usize = 10;
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Destination of decoded batches
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Returns `Ok(false)` when the batch was rejected and nothing was enqueued
    async fn distribute(&self, batch: &ChangeBatch) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct DistributorOptions {
    /// Concurrent `add` calls admitted
    pub permits: usize,
    /// Longest wait on the flow-control latch before a batch is rejected
    pub backpressure_timeout: Duration,
}

impl Default for DistributorOptions {
    fn default() -> Self {
        Self {
            permits: DEFAULT_PERMITS,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Registry of per-table holders
pub struct EventDistributor {
    holders: RwLock<HashMap<String, Arc<dyn EventQueueHolder>>>,
    permits: Semaphore,
    permit_count: usize,
    accepting: AtomicBool,
    latch: Arc<FlowControlLatch>,
    backpressure_timeout: Duration,
    stats: RwLock<Option<Arc<dyn QueueStatistics>>>,
}

impl Default for EventDistributor {
    fn default() -> Self {
        Self::new(DistributorOptions::default())
    }
}

impl EventDistributor {
    pub fn new(options: DistributorOptions) -> Self {
        let permit_count = options.permits.max(1);
        Self {
            holders: RwLock::new(HashMap::new()),
            permits: Semaphore::new(permit_count),
            permit_count,
            accepting: AtomicBool::new(true),
            latch: Arc::new(FlowControlLatch::new()),
            backpressure_timeout: options.backpressure_timeout,
            stats: RwLock::new(None),
        }
    }

    /// Latch shared by every queue of this distributor
    pub fn latch(&self) -> Arc<FlowControlLatch> {
        Arc::clone(&self.latch)
    }

    pub fn is_closed(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.current_stats().is_some()
    }

    fn current_stats(&self) -> Option<Arc<dyn QueueStatistics>> {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn holder(&self, table: &str) -> Option<Arc<dyn EventQueueHolder>> {
        self.holders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned()
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .holders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    /// Offers a batch to the holders
    ///
    /// Returns `Ok(false)` when the flow-control latch did not clear within the
    /// backpressure timeout. Records of tables without a holder are dropped.
    pub async fn add(&self, batch: &ChangeBatch) -> Result<bool> {
        if self.is_closed() {
            return Err(EventsError::DistributorClosed);
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EventsError::DistributorClosed)?;

        if !self.latch.await_clear(self.backpressure_timeout).await {
            debug!(
                "Backpressure engaged on {} partitions, rejecting batch of {} records",
                self.latch.count(),
                batch.len()
            );
            return Ok(false);
        }

        let holders = self.holders.read().unwrap_or_else(|e| e.into_inner());
        for record in &batch.records {
            match holders.get(&record.table) {
                Some(holder) => holder.add(Arc::clone(record))?,
                None => trace!("No holder for table '{}', dropping record", record.table),
            }
        }
        Ok(true)
    }

    /// Registers the holder of `table`, replacing and returning any previous one
    ///
    /// A holder registered after `init` is initialized immediately.
    pub fn register_holder(
        &self,
        table: &str,
        options: HolderOptions,
        resolver: Arc<dyn PartitionResolver>,
    ) -> Result<Option<Arc<dyn EventQueueHolder>>> {
        let holder = build_holder(table, options, resolver, self.latch())?;
        if let Some(stats) = self.current_stats() {
            holder.init(stats)?;
        }

        info!(
            "Registered holder for '{}' with {} partitions",
            table,
            holder.queue_count()
        );
        let previous = self
            .holders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string(), holder);
        if previous.is_some() {
            warn!("Replaced existing holder for '{}'", table);
        }
        Ok(previous)
    }

    /// Removes the holder of `table`; the caller owns closing it
    pub fn unregister_holder(&self, table: &str) -> Option<Arc<dyn EventQueueHolder>> {
        self.holders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(table)
    }

    /// Adds a handler to `table`, creating a shared single-partition holder when missing
    pub fn register_handler(&self, table: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        let holder = match self.holder(table) {
            Some(holder) => holder,
            None => {
                let holder = build_holder(
                    table,
                    HolderOptions::default(),
                    Arc::new(SinglePartitionResolver),
                    self.latch(),
                )?;
                if let Some(stats) = self.current_stats() {
                    holder.init(stats)?;
                }
                let mut holders = self.holders.write().unwrap_or_else(|e| e.into_inner());
                Arc::clone(holders.entry(table.to_string()).or_insert(holder))
            }
        };
        holder.register_handler(handler);
        Ok(())
    }

    /// Returns whether the handler was registered on `table`
    pub fn unregister_handler(&self, table: &str, handler: &Arc<dyn EventHandler>) -> bool {
        self.holder(table)
            .map(|holder| holder.unregister_handler(handler))
            .unwrap_or(false)
    }

    /// Initializes every holder; later registrations are initialized on arrival
    pub fn init(&self, stats: Option<Arc<dyn QueueStatistics>>) -> Result<()> {
        let stats = stats.unwrap_or_else(|| Arc::new(NoopStatistics));
        *self.stats.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&stats));

        let holders: Vec<Arc<dyn EventQueueHolder>> = self
            .holders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for holder in holders {
            holder.init(Arc::clone(&stats))?;
        }
        info!("Event distributor initialized");
        Ok(())
    }

    /// Stops intake, waits for in-flight `add` calls and drains every holder
    pub async fn close(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("Closing event distributor");
        }

        match self.permits.acquire_many(self.permit_count as u32).await {
            Ok(permits) => {
                // Closing first keeps the returned permits unusable
                self.permits.close();
                drop(permits);
            }
            Err(_) => return,
        }

        let holders: Vec<Arc<dyn EventQueueHolder>> = self
            .holders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for holder in holders {
            holder.close().await;
        }
        info!("Event distributor closed");
    }
}

#[async_trait]
impl BatchSink for EventDistributor {
    async fn distribute(&self, batch: &ChangeBatch) -> Result<bool> {
        self.add(batch).await
    }
}
