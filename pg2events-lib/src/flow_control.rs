//! Flow control between event queues and the replication producer
//!
//! Every queue reports its depth to a [`LimitObserver`]. A [`SoftLimitObserver`]
//! counts the shared [`FlowControlLatch`] up once when its queue grows past the
//! soft limit and down once when it shrinks back below it. The distributor waits
//! on the latch before accepting a batch, so a single saturated partition pauses
//! intake for the whole stream.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Counter of partitions over their soft limit
///
/// Waiters are released together when the count returns to zero.
#[derive(Debug, Default)]
pub struct FlowControlLatch {
    count: AtomicI64,
    clear_notify: Notify,
}

impl FlowControlLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_up(&self) {
        let current = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Flow control latch counted up to {}", current);
    }

    pub fn count_down(&self) {
        let current = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!("Flow control latch counted down to {}", current);
        if current <= 0 {
            self.clear_notify.notify_waiters();
        }
    }

    #[inline]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_clear(&self) -> bool {
        self.count() <= 0
    }

    /// Waits until the latch is clear or `timeout` elapses
    ///
    /// Returns whether the latch was clear. A zero timeout is an immediate check.
    pub async fn await_clear(&self, timeout: Duration) -> bool {
        if self.is_clear() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let wait = async {
            loop {
                let notified = self.clear_notify.notified();
                tokio::pin!(notified);
                // Register before re-checking so a count_down in between is not lost
                notified.as_mut().enable();
                if self.is_clear() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Receives queue depth transitions
pub trait LimitObserver: Send + Sync {
    fn added(&self);
    fn removed(&self);
}

/// Observer for queues without a soft limit
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLimitObserver;

impl LimitObserver for NoLimitObserver {
    fn added(&self) {}
    fn removed(&self) {}
}

/// Tracks one queue against its soft limit
///
/// The queue is over once its depth exceeds `limit` and clear again once the
/// depth drops below it. Each transition moves the shared latch exactly once.
#[derive(Debug)]
pub struct SoftLimitObserver {
    limit: usize,
    count: AtomicUsize,
    over: AtomicBool,
    latch: Arc<FlowControlLatch>,
}

impl SoftLimitObserver {
    pub fn new(limit: usize, latch: Arc<FlowControlLatch>) -> Self {
        Self {
            limit,
            count: AtomicUsize::new(0),
            over: AtomicBool::new(false),
            latch,
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_over(&self) -> bool {
        self.over.load(Ordering::Acquire)
    }

    fn try_set_over(&self) -> bool {
        if self
            .over
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("Queue exceeded soft limit {}", self.limit);
            self.latch.count_up();
            true
        } else {
            false
        }
    }

    fn try_clear_over(&self) -> bool {
        if self
            .over
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("Queue dropped below soft limit {}", self.limit);
            self.latch.count_down();
            true
        } else {
            false
        }
    }
}

impl LimitObserver for SoftLimitObserver {
    fn added(&self) {
        let current = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if current > self.limit && self.try_set_over() {
            // A concurrent removal may have drained below the limit before the flag flipped
            if self.count() < self.limit {
                self.try_clear_over();
            }
        }
    }

    fn removed(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .unwrap_or(0);
        let current = previous.saturating_sub(1);
        if current < self.limit && self.try_clear_over() && self.count() > self.limit {
            self.try_set_over();
        }
    }
}

/// Builds the observer for a queue with the given soft limit (0 disables it)
pub fn limit_observer(soft_limit: usize, latch: &Arc<FlowControlLatch>) -> Arc<dyn LimitObserver> {
    if soft_limit == 0 {
        Arc::new(NoLimitObserver)
    } else {
        Arc::new(SoftLimitObserver::new(soft_limit, Arc::clone(latch)))
    }
}
