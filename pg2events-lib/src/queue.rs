//! Per-partition event queue
//!
//! Records are appended by the distributor and drained by a task that is
//! spawned on the 0 -> 1 transition of the pending count and keeps running
//! while the count is non-zero. At most one drain pops from a queue at a time,
//! so records of one partition reach their handlers in order.

use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{EventsError, Result};
use crate::flow_control::LimitObserver;
use crate::handler::EventHandler;
use crate::statistics::QueueStatisticsScope;
use crate::types::ChangeRecord;

/// Handler list shared between a holder and its queues
pub type SharedHandlers = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a queue hands records to handlers
#[derive(Clone)]
pub enum QueueDelivery {
    /// One handler, invoked on the drain task
    Single(Arc<dyn EventHandler>),
    /// Every registered handler, one task each on `executor`, joined per record
    FanOut {
        handlers: SharedHandlers,
        executor: Handle,
    },
}

struct QueueInner {
    accepting: AtomicBool,
    pending: AtomicUsize,
    records: Mutex<VecDeque<Arc<ChangeRecord>>>,
    delivery: QueueDelivery,
    stats: QueueStatisticsScope,
    observer: Arc<dyn LimitObserver>,
}

/// Sequential buffer in front of one partition's handlers
pub struct EventQueue {
    inner: Arc<QueueInner>,
    executor: Handle,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    pub fn new(
        delivery: QueueDelivery,
        stats: QueueStatisticsScope,
        observer: Arc<dyn LimitObserver>,
        executor: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                accepting: AtomicBool::new(true),
                pending: AtomicUsize::new(0),
                records: Mutex::new(VecDeque::new()),
                delivery,
                stats,
                observer,
            }),
            executor,
            drain_task: Mutex::new(None),
        }
    }

    /// Appends a record and schedules a drain if none is running
    pub fn add(&self, record: Arc<ChangeRecord>) -> Result<()> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(EventsError::QueueClosed);
        }

        self.inner.stats.added(&record);
        self.inner.observer.added();
        self.inner.lock_records().push_back(record);

        if self.inner.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            let handle = self.executor.spawn(drain(Arc::clone(&self.inner)));
            let mut slot = self.drain_task.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Records buffered and not yet picked up by the drain
    pub fn len(&self) -> usize {
        self.inner.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting records and waits until everything buffered is handled
    pub async fn close(&self) {
        self.inner.accepting.store(false, Ordering::Release);

        while self.inner.pending.load(Ordering::Acquire) != 0 {
            tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
        }

        let handle = {
            let mut slot = self.drain_task.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Drain task of {:?} ended abnormally: {}", self.inner.stats, e);
            }
        }
        debug!("Closed event queue {:?}", self.inner.stats);
    }
}

impl QueueInner {
    fn lock_records(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<ChangeRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop(&self) -> Option<Arc<ChangeRecord>> {
        self.lock_records().pop_front()
    }

    async fn process(&self, record: Arc<ChangeRecord>) {
        self.stats.polled(&record);

        match &self.delivery {
            QueueDelivery::Single(handler) => {
                let (success, duration) = invoke(handler.as_ref(), &record).await;
                self.stats
                    .handler_completed(handler.name(), duration, success, &record);
            }
            QueueDelivery::FanOut { handlers, executor } => {
                let snapshot: Vec<Arc<dyn EventHandler>> =
                    handlers.read().unwrap_or_else(|e| e.into_inner()).clone();

                let tasks = snapshot.into_iter().map(|handler| {
                    let record = Arc::clone(&record);
                    executor.spawn(async move {
                        let (success, duration) = invoke(handler.as_ref(), &record).await;
                        (handler, success, duration)
                    })
                });

                for joined in join_all(tasks).await {
                    match joined {
                        Ok((handler, success, duration)) => {
                            self.stats
                                .handler_completed(handler.name(), duration, success, &record);
                        }
                        Err(e) => error!("Handler task for {:?} failed to complete: {}", self.stats, e),
                    }
                }
            }
        }

        self.stats.handled(&record);
        self.observer.removed();
    }
}

async fn drain(inner: Arc<QueueInner>) {
    let mut batch = inner.pending.load(Ordering::Acquire);
    loop {
        let mut processed = 0;
        // Counted records are always in the deque, pushes happen before the count
        while processed < batch {
            match inner.pop() {
                Some(record) => {
                    inner.process(record).await;
                    processed += 1;
                }
                None => tokio::task::yield_now().await,
            }
        }

        let remaining = inner.pending.fetch_sub(batch, Ordering::AcqRel) - batch;
        if remaining == 0 {
            break;
        }
        batch = remaining;
    }
}

/// Runs one handler on one record, catching errors and panics
async fn invoke(handler: &dyn EventHandler, record: &ChangeRecord) -> (bool, Duration) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(handler.handle(record)).catch_unwind().await;
    let duration = started.elapsed();

    let success = match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(
                handler = handler.name(),
                table = %record.table,
                kind = %record.kind,
                "Handler failed: {}",
                e
            );
            false
        }
        Err(_) => {
            error!(
                handler = handler.name(),
                table = %record.table,
                kind = %record.kind,
                "Handler panicked"
            );
            false
        }
    };
    (success, duration)
}
