//! Change capture producer
//!
//! One task polls the replication channel, decodes each message, hands the
//! batch to the distributor and confirms the position only after the batch was
//! accepted. Anything else resets the connection so the message is delivered
//! again: delivery is at-least-once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::ReplicationChannel;
use crate::decoder::MessageDecoder;
use crate::distributor::BatchSink;
use crate::error::{EventsError, Result};
use crate::statistics::{NoopStatistics, ProducerStatistics};

struct ProducerShared {
    channel: Mutex<ReplicationChannel>,
    decoder: Arc<dyn MessageDecoder>,
    sink: Arc<dyn BatchSink>,
    stats: Arc<dyn ProducerStatistics>,
    running: AtomicBool,
}

/// Polling loop from the replication channel into a [`BatchSink`]
pub struct ChangeCaptureProducer {
    shared: Arc<ProducerShared>,
    task: StdMutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl ChangeCaptureProducer {
    pub fn new(
        channel: ReplicationChannel,
        decoder: Arc<dyn MessageDecoder>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        Self::with_statistics(channel, decoder, sink, Arc::new(NoopStatistics))
    }

    pub fn with_statistics(
        channel: ReplicationChannel,
        decoder: Arc<dyn MessageDecoder>,
        sink: Arc<dyn BatchSink>,
        stats: Arc<dyn ProducerStatistics>,
    ) -> Self {
        Self {
            shared: Arc::new(ProducerShared {
                channel: Mutex::new(channel),
                decoder,
                sink,
                stats,
                running: AtomicBool::new(false),
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Spawns the polling loop, sleeping `idle_poll_timeout` whenever nothing was produced
    pub fn start(&self, idle_poll_timeout: Duration) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EventsError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            shared.run(idle_poll_timeout, loop_token).await;
        });

        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some((handle, token));
        self.shared.stats.producer_running();
        info!("Change capture producer started");
        Ok(())
    }

    /// Stops the loop after the current iteration and waits for it
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((handle, token)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                error!("Producer task ended abnormally: {}", e);
            }
        }
        self.shared.stats.producer_stopped();
        info!("Change capture producer stopped");
    }

    /// Runs one loop iteration, returns whether a message was produced
    pub async fn produce_once(&self) -> bool {
        self.shared.produce().await
    }

    pub async fn create_slot(&self) -> Result<()> {
        self.shared.channel.lock().await.create_slot().await
    }

    pub async fn slot_exists(&self) -> Result<bool> {
        self.shared.channel.lock().await.slot_exists().await
    }

    /// Closes the stream and drops the slot; refused while running
    pub async fn drop_slot(&self) -> Result<()> {
        if self.is_running() {
            return Err(EventsError::ProducerRunning);
        }
        let mut channel = self.shared.channel.lock().await;
        channel.close().await;
        channel.drop_slot().await
    }

    /// Closes the replication connection; the producer must be stopped
    pub async fn close(&self) {
        self.stop().await;
        self.shared.channel.lock().await.close().await;
    }
}

impl ProducerShared {
    async fn run(&self, idle_poll_timeout: Duration, token: CancellationToken) {
        self.ensure_slot().await;

        while self.running.load(Ordering::Acquire) {
            if self.produce().await {
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(idle_poll_timeout) => {}
            }
        }
        debug!("Producer loop exited");
    }

    async fn ensure_slot(&self) {
        let mut channel = self.channel.lock().await;
        match channel.slot_exists().await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = channel.create_slot().await {
                    error!("Cannot create replication slot '{}': {}", channel.slot_name(), e);
                }
            }
            Err(e) => error!("Cannot check replication slot '{}': {}", channel.slot_name(), e),
        }
    }

    async fn produce(&self) -> bool {
        let mut channel = self.channel.lock().await;
        let Some(event) = channel.receive().await else {
            trace!("No replication message pending");
            return false;
        };
        self.stats.event_received();

        if !self.decoder.has_changes(&event.message) {
            trace!("Keep-alive message at {}", event.received_position);
            channel.commit(event.received_position, None).await;
            return true;
        }

        let batch = match self.decoder.decode(&event.message) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Cannot decode message at {}: {}", event.received_position, e);
                channel.reset_uncommitted();
                return false;
            }
        };
        if batch.is_empty() {
            channel.commit(event.received_position, None).await;
            return true;
        }

        match self.sink.distribute(&batch).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Batch at {} rejected by backpressure, resetting stream",
                    event.received_position
                );
                channel.reset_uncommitted();
                return false;
            }
            Err(e) => {
                warn!("Failed to distribute batch at {}: {}", event.received_position, e);
                channel.reset_uncommitted();
                return false;
            }
        }
        self.stats.event_handled(&batch, event.read_time);

        if !channel.commit(event.received_position, batch.resume_token).await {
            debug!("Commit of {} not confirmed", event.received_position);
        }
        true
    }
}
