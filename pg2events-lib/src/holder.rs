//! Per-table queue holders
//!
//! A holder owns the partitions of one table. The shared variant runs one queue
//! per partition for all handlers; the isolated variant runs one queue per
//! partition and handler, so a slow handler only delays itself.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::error::{EventsError, Result};
use crate::flow_control::{limit_observer, FlowControlLatch};
use crate::handler::EventHandler;
use crate::partition::PartitionResolver;
use crate::queue::{EventQueue, QueueDelivery, SharedHandlers};
use crate::statistics::{QueueStatistics, QueueStatisticsScope};
use crate::types::ChangeRecord;

/// Queue layout of a holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// One queue per partition, handlers fan out per record
    #[default]
    Shared,
    /// One queue per partition and handler
    Isolated,
}

impl FromStr for QueueMode {
    type Err = EventsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shared" | "common" => Ok(QueueMode::Shared),
            "isolated" | "distributed" => Ok(QueueMode::Isolated),
            other => Err(EventsError::config(format!("Unknown queue mode '{}'", other))),
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Shared => write!(f, "shared"),
            QueueMode::Isolated => write!(f, "isolated"),
        }
    }
}

/// Registration options for a table
#[derive(Debug, Clone)]
pub struct HolderOptions {
    pub queue_count: usize,
    /// Queue depth that engages backpressure, 0 disables it
    pub soft_limit: usize,
    pub mode: QueueMode,
    /// Runtime the drains run on, the ambient one when `None`
    pub drain_executor: Option<Handle>,
    /// Runtime shared-queue handlers run on, the drain runtime when `None`
    pub handler_executor: Option<Handle>,
}

impl Default for HolderOptions {
    fn default() -> Self {
        Self {
            queue_count: 1,
            soft_limit: 0,
            mode: QueueMode::Shared,
            drain_executor: None,
            handler_executor: None,
        }
    }
}

impl HolderOptions {
    pub fn new(queue_count: usize, soft_limit: usize, mode: QueueMode) -> Self {
        Self {
            queue_count,
            soft_limit,
            mode,
            ..Default::default()
        }
    }

    pub fn with_drain_executor(mut self, executor: Handle) -> Self {
        self.drain_executor = Some(executor);
        self
    }

    pub fn with_handler_executor(mut self, executor: Handle) -> Self {
        self.handler_executor = Some(executor);
        self
    }
}

/// Owner of the queues of one table
#[async_trait]
pub trait EventQueueHolder: Send + Sync {
    fn table(&self) -> &str;

    fn queue_count(&self) -> usize;

    fn is_initialized(&self) -> bool;

    /// Builds the queues; a no-op when already initialized
    fn init(&self, stats: Arc<dyn QueueStatistics>) -> Result<()>;

    fn add(&self, record: Arc<ChangeRecord>) -> Result<()>;

    fn register_handler(&self, handler: Arc<dyn EventHandler>);

    /// Removes a handler by identity, returns whether it was registered
    fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) -> bool;

    /// Drains and drops every queue, the holder may be initialized again
    async fn close(&self);
}

/// Builds the holder variant selected by `options.mode`
pub fn build_holder(
    table: &str,
    options: HolderOptions,
    resolver: Arc<dyn PartitionResolver>,
    latch: Arc<FlowControlLatch>,
) -> Result<Arc<dyn EventQueueHolder>> {
    if options.queue_count == 0 {
        return Err(EventsError::invalid_argument(format!(
            "Queue count for table '{}' must be positive",
            table
        )));
    }
    if table.is_empty() {
        return Err(EventsError::invalid_argument("Table name must not be empty"));
    }

    let core = HolderCore {
        table: table.to_string(),
        options,
        resolver,
        latch,
    };
    Ok(match core.options.mode {
        QueueMode::Shared => Arc::new(SharedQueueHolder::new(core)),
        QueueMode::Isolated => Arc::new(IsolatedQueueHolder::new(core)),
    })
}

pub(crate) fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct HolderCore {
    table: String,
    options: HolderOptions,
    resolver: Arc<dyn PartitionResolver>,
    latch: Arc<FlowControlLatch>,
}

impl HolderCore {
    fn drain_executor(&self) -> Result<Handle> {
        match &self.options.drain_executor {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current().map_err(|e| {
                EventsError::config(format!("No runtime available for event queues: {}", e))
            }),
        }
    }

    fn partition_of(&self, record: &ChangeRecord) -> usize {
        let count = self.options.queue_count;
        // Resolvers are external code, clamp instead of indexing out of bounds
        self.resolver.resolve(count, record).min(count - 1)
    }

    fn build_queue(
        &self,
        partition: usize,
        handler_name: Option<String>,
        delivery: QueueDelivery,
        stats: &Arc<dyn QueueStatistics>,
        executor: &Handle,
    ) -> EventQueue {
        EventQueue::new(
            delivery,
            QueueStatisticsScope::new(&self.table, partition, handler_name, Arc::clone(stats)),
            limit_observer(self.options.soft_limit, &self.latch),
            executor.clone(),
        )
    }
}

/// All handlers of a table share one queue per partition
pub struct SharedQueueHolder {
    core: HolderCore,
    handlers: SharedHandlers,
    queues: RwLock<Option<Arc<Vec<EventQueue>>>>,
}

impl SharedQueueHolder {
    fn new(core: HolderCore) -> Self {
        Self {
            core,
            handlers: Arc::new(RwLock::new(Vec::new())),
            queues: RwLock::new(None),
        }
    }
}

#[async_trait]
impl EventQueueHolder for SharedQueueHolder {
    fn table(&self) -> &str {
        &self.core.table
    }

    fn queue_count(&self) -> usize {
        self.core.options.queue_count
    }

    fn is_initialized(&self) -> bool {
        self.queues.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn init(&self, stats: Arc<dyn QueueStatistics>) -> Result<()> {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.is_some() {
            return Ok(());
        }

        let drain_executor = self.core.drain_executor()?;
        let handler_executor = self
            .core
            .options
            .handler_executor
            .clone()
            .unwrap_or_else(|| drain_executor.clone());

        let built = (0..self.core.options.queue_count)
            .map(|partition| {
                let delivery = QueueDelivery::FanOut {
                    handlers: Arc::clone(&self.handlers),
                    executor: handler_executor.clone(),
                };
                self.core
                    .build_queue(partition, None, delivery, &stats, &drain_executor)
            })
            .collect();
        *queues = Some(Arc::new(built));

        info!(
            "Initialized shared holder for '{}' with {} partitions",
            self.core.table, self.core.options.queue_count
        );
        Ok(())
    }

    fn add(&self, record: Arc<ChangeRecord>) -> Result<()> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let queues = queues
            .as_ref()
            .ok_or_else(|| EventsError::HolderNotInitialized(self.core.table.clone()))?;
        let partition = self.core.partition_of(&record);
        queues[partition].add(record)
    }

    fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        debug!("Registering handler '{}' for '{}'", handler.name(), self.core.table);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        handlers.len() != before
    }

    async fn close(&self) {
        let queues = self.queues.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(queues) = queues {
            for queue in queues.iter() {
                queue.close().await;
            }
            info!("Closed shared holder for '{}'", self.core.table);
        }
    }
}

/// Each handler gets its own queue per partition
///
/// Handler registrations take effect at the next `init`.
pub struct IsolatedQueueHolder {
    core: HolderCore,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    /// Indexed by partition, then by handler
    queues: RwLock<Option<Arc<Vec<Vec<EventQueue>>>>>,
}

impl IsolatedQueueHolder {
    fn new(core: HolderCore) -> Self {
        Self {
            core,
            handlers: RwLock::new(Vec::new()),
            queues: RwLock::new(None),
        }
    }
}

#[async_trait]
impl EventQueueHolder for IsolatedQueueHolder {
    fn table(&self) -> &str {
        &self.core.table
    }

    fn queue_count(&self) -> usize {
        self.core.options.queue_count
    }

    fn is_initialized(&self) -> bool {
        self.queues.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn init(&self, stats: Arc<dyn QueueStatistics>) -> Result<()> {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.is_some() {
            return Ok(());
        }

        let drain_executor = self.core.drain_executor()?;
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner()).clone();

        let built = (0..self.core.options.queue_count)
            .map(|partition| {
                handlers
                    .iter()
                    .map(|handler| {
                        self.core.build_queue(
                            partition,
                            Some(handler.name().to_string()),
                            QueueDelivery::Single(Arc::clone(handler)),
                            &stats,
                            &drain_executor,
                        )
                    })
                    .collect()
            })
            .collect();
        *queues = Some(Arc::new(built));

        info!(
            "Initialized isolated holder for '{}' with {} partitions and {} handlers",
            self.core.table,
            self.core.options.queue_count,
            handlers.len()
        );
        Ok(())
    }

    fn add(&self, record: Arc<ChangeRecord>) -> Result<()> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let queues = queues
            .as_ref()
            .ok_or_else(|| EventsError::HolderNotInitialized(self.core.table.clone()))?;
        let partition = self.core.partition_of(&record);
        for queue in &queues[partition] {
            queue.add(Arc::clone(&record))?;
        }
        Ok(())
    }

    fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        if self.is_initialized() {
            debug!(
                "Handler '{}' for '{}' takes effect at the next init",
                handler.name(),
                self.core.table
            );
        }
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        handlers.len() != before
    }

    async fn close(&self) {
        let queues = self.queues.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(queues) = queues {
            for queue in queues.iter().flatten() {
                queue.close().await;
            }
            info!("Closed isolated holder for '{}'", self.core.table);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use crate::partition::{PrimaryKeyResolver, SinglePartitionResolver, StaticPrimaryKeyProvider};
    use crate::statistics::NoopStatistics;
    use crate::types::RowImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counting(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        Arc::new(FnHandler::new(name, move |_: &ChangeRecord| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn record(id: &str) -> Arc<ChangeRecord> {
        Arc::new(ChangeRecord::insert("orders", RowImage::new().with("id", id)))
    }

    fn holder(mode: QueueMode, queue_count: usize) -> Arc<dyn EventQueueHolder> {
        let provider = StaticPrimaryKeyProvider::new().with_table("orders", ["id"]);
        build_holder(
            "orders",
            HolderOptions::new(queue_count, 0, mode),
            Arc::new(PrimaryKeyResolver::new(Arc::new(provider))),
            Arc::new(FlowControlLatch::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_queue_count_rejected() {
        let result = build_holder(
            "orders",
            HolderOptions::new(0, 0, QueueMode::Shared),
            Arc::new(SinglePartitionResolver),
            Arc::new(FlowControlLatch::new()),
        );
        assert!(matches!(result, Err(EventsError::InvalidArgument(_))));
    }

    #[test]
    fn test_queue_mode_parsing() {
        assert_eq!("Shared".parse::<QueueMode>().unwrap(), QueueMode::Shared);
        assert_eq!("isolated".parse::<QueueMode>().unwrap(), QueueMode::Isolated);
        assert!("other".parse::<QueueMode>().is_err());
    }

    #[tokio::test]
    async fn test_add_before_init_fails() {
        let holder = holder(QueueMode::Shared, 2);
        let err = holder.add(record("1")).unwrap_err();
        assert!(matches!(err, EventsError::HolderNotInitialized(t) if t == "orders"));
    }

    #[tokio::test]
    async fn test_shared_holder_delivers_to_all_handlers() {
        let holder = holder(QueueMode::Shared, 4);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        holder.register_handler(counting("a", a.clone()));
        holder.register_handler(counting("b", b.clone()));
        holder.init(Arc::new(NoopStatistics)).unwrap();
        holder.init(Arc::new(NoopStatistics)).unwrap();

        for id in 0..50 {
            holder.add(record(&id.to_string())).unwrap();
        }
        holder.close().await;

        assert_eq!(a.load(Ordering::SeqCst), 50);
        assert_eq!(b.load(Ordering::SeqCst), 50);
        assert!(!holder.is_initialized());
    }

    #[tokio::test]
    async fn test_shared_holder_unregister_by_identity() {
        let holder = holder(QueueMode::Shared, 1);
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting("a", count.clone());
        let lookalike = counting("a", count.clone());
        holder.register_handler(Arc::clone(&handler));

        assert!(!holder.unregister_handler(&lookalike));
        assert!(holder.unregister_handler(&handler));
        assert!(!holder.unregister_handler(&handler));
    }

    #[tokio::test]
    async fn test_isolated_holder_late_handler_waits_for_next_init() {
        let holder = holder(QueueMode::Isolated, 2);
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));
        holder.register_handler(counting("early", early.clone()));
        holder.init(Arc::new(NoopStatistics)).unwrap();
        holder.register_handler(counting("late", late.clone()));

        for id in 0..10 {
            holder.add(record(&id.to_string())).unwrap();
        }
        holder.close().await;
        assert_eq!(early.load(Ordering::SeqCst), 10);
        assert_eq!(late.load(Ordering::SeqCst), 0);

        holder.init(Arc::new(NoopStatistics)).unwrap();
        for id in 0..10 {
            holder.add(record(&id.to_string())).unwrap();
        }
        holder.close().await;
        assert_eq!(early.load(Ordering::SeqCst), 20);
        assert_eq!(late.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_isolated_holder_keeps_per_key_order() {
        let holder = holder(QueueMode::Isolated, 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        holder.register_handler(Arc::new(FnHandler::new("order", move |r: &ChangeRecord| {
            let value = r
                .after
                .as_ref()
                .and_then(|row| row.get("seq").flatten())
                .unwrap_or_default()
                .to_string();
            sink.lock().unwrap().push(value);
            Ok(())
        })));
        holder.init(Arc::new(NoopStatistics)).unwrap();

        for seq in 0..30 {
            let row = RowImage::new().with("id", "K1").with("seq", seq.to_string());
            holder
                .add(Arc::new(ChangeRecord::update("orders", None, row)))
                .unwrap();
        }
        holder.close().await;

        let expected: Vec<String> = (0..30).map(|s| s.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }
}
