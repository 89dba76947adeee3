//! Application Runner
//!
//! This module wires the replication channel, the distributor and the producer
//! together and runs them until a shutdown signal arrives.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ReplicationChannel, StreamOptions};
use crate::config::Config;
use crate::decoder::Wal2JsonDecoder;
use crate::distributor::{DistributorOptions, EventDistributor};
use crate::error::Result;
use crate::handler::EventHandler;
use crate::holder::HolderOptions;
use crate::partition::{PartitionResolver, PrimaryKeyProvider, PrimaryKeyResolver};
use crate::producer::ChangeCaptureProducer;
use crate::slot::{ReplicationConnector, SlotCatalog};
use crate::statistics::{NoopStatistics, ProducerStatistics, QueueStatistics};

/// Change capture application
///
/// One holder per configured table is registered up front, keyed by the bare
/// table name and partitioned by primary key.
pub struct EventsApp {
    config: Config,
    distributor: Arc<EventDistributor>,
    producer: ChangeCaptureProducer,
    resolver: Arc<dyn PartitionResolver>,
    queue_stats: Arc<dyn QueueStatistics>,
    shutdown: CancellationToken,
}

impl EventsApp {
    /// Builds the application over any replication connector
    pub fn with_connector(
        config: Config,
        connector: Arc<dyn ReplicationConnector>,
        catalog: Arc<dyn SlotCatalog>,
        keys: Arc<dyn PrimaryKeyProvider>,
    ) -> Result<Self> {
        Self::with_statistics(
            config,
            connector,
            catalog,
            keys,
            Arc::new(NoopStatistics),
            Arc::new(NoopStatistics),
        )
    }

    /// Same as [`EventsApp::with_connector`] with explicit statistics sinks
    pub fn with_statistics(
        config: Config,
        connector: Arc<dyn ReplicationConnector>,
        catalog: Arc<dyn SlotCatalog>,
        keys: Arc<dyn PrimaryKeyProvider>,
        queue_stats: Arc<dyn QueueStatistics>,
        producer_stats: Arc<dyn ProducerStatistics>,
    ) -> Result<Self> {
        let distributor = Arc::new(EventDistributor::new(DistributorOptions {
            permits: config.distribution_permits,
            backpressure_timeout: config.backpressure_timeout,
        }));
        let resolver: Arc<dyn PartitionResolver> = Arc::new(PrimaryKeyResolver::new(keys));

        for table in config.table_names() {
            distributor.register_holder(&table, holder_options(&config), Arc::clone(&resolver))?;
        }

        let options = StreamOptions::new(config.slot_name.clone())
            .with_tables(config.tables.clone())
            .with_plugin(config.output_plugin.clone())
            .with_read_window(config.read_window);
        let channel = ReplicationChannel::new(connector, catalog, options);
        let producer = ChangeCaptureProducer::with_statistics(
            channel,
            Arc::new(Wal2JsonDecoder::new()),
            distributor.clone(),
            producer_stats,
        );

        Ok(Self {
            config,
            distributor,
            producer,
            resolver,
            queue_stats,
            shutdown: CancellationToken::new(),
        })
    }

    /// Connects to PostgreSQL over libpq and loads primary keys from the catalog
    #[cfg(feature = "libpq")]
    pub async fn connect(config: Config) -> Result<Self> {
        use crate::connection::PostgresCatalog;
        use crate::libpq::LibpqConnector;
        use crate::retry::RetryConfig;

        tracing::info!("Initializing change capture application");
        let retry = RetryConfig::from(&config);
        let catalog =
            PostgresCatalog::connect(&config.catalog_conninfo(), &retry).await?;
        let keys = catalog.load_primary_keys(&config.tables).await?;
        let connector = Arc::new(LibpqConnector::new(&config));

        #[cfg(feature = "metrics")]
        let (queue_stats, producer_stats): (Arc<dyn QueueStatistics>, Arc<dyn ProducerStatistics>) = (
            Arc::new(crate::monitoring::PrometheusStatistics::new()),
            Arc::new(crate::monitoring::PrometheusStatistics::new()),
        );
        #[cfg(not(feature = "metrics"))]
        let (queue_stats, producer_stats): (Arc<dyn QueueStatistics>, Arc<dyn ProducerStatistics>) =
            (Arc::new(NoopStatistics), Arc::new(NoopStatistics));

        Self::with_statistics(
            config,
            connector,
            Arc::new(catalog),
            Arc::new(keys),
            queue_stats,
            producer_stats,
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn distributor(&self) -> &Arc<EventDistributor> {
        &self.distributor
    }

    pub fn producer(&self) -> &ChangeCaptureProducer {
        &self.producer
    }

    /// Token that ends [`EventsApp::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Adds a handler to `table`, creating its holder with the configured defaults
    pub fn register_handler(&self, table: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        if self.distributor.holder(table).is_none() {
            self.distributor.register_holder(
                table,
                holder_options(&self.config),
                Arc::clone(&self.resolver),
            )?;
        }
        self.distributor.register_handler(table, handler)
    }

    /// Initializes the distributor and starts the producer
    pub fn start(&self) -> Result<()> {
        self.distributor.init(Some(Arc::clone(&self.queue_stats)))?;
        self.producer.start(self.config.idle_poll_timeout)?;
        tracing::info!(
            "Change capture running on slot '{}' for tables {:?}",
            self.config.slot_name,
            self.distributor.tables()
        );
        Ok(())
    }

    /// Stops the producer, drains every queue and closes the connection
    pub async fn stop(&self) {
        self.producer.stop().await;
        self.distributor.close().await;
        self.producer.close().await;
        tracing::info!("Change capture stopped");
    }

    /// Runs until SIGINT/SIGTERM or until the shutdown token is cancelled
    pub async fn run(&self) -> Result<()> {
        self.start()?;

        let signals = tokio::spawn(setup_shutdown_handler(self.shutdown.clone()));
        self.shutdown.cancelled().await;
        signals.abort();

        tracing::info!("Shutdown requested, stopping change capture gracefully");
        self.stop().await;
        Ok(())
    }
}

fn holder_options(config: &Config) -> HolderOptions {
    HolderOptions::new(
        config.default_queue_count,
        config.default_soft_limit,
        config.default_queue_mode,
    )
}

/// Connects, registers `handler_for(table)` on every configured table and runs
///
/// # Example
///
/// ```rust,no_run
/// use pg2events_lib::{load_config_from_env, run_events_app, EventHandler, LoggingHandler};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_config_from_env()?;
///     run_events_app(config, |table| -> Arc<dyn EventHandler> {
///         Arc::new(LoggingHandler::new(table))
///     })
///     .await?;
///     Ok(())
/// }
/// ```
#[cfg(feature = "libpq")]
pub async fn run_events_app<F>(config: Config, handler_for: F) -> Result<()>
where
    F: Fn(&str) -> Arc<dyn EventHandler>,
{
    let app = EventsApp::connect(config).await?;
    for table in app.config().table_names() {
        app.register_handler(&table, handler_for(&table))?;
    }
    app.run().await
}

/// Set up graceful shutdown signal handling
///
/// Cancels `shutdown_token` on SIGTERM/SIGINT (Ctrl+C on Windows).
async fn setup_shutdown_handler(shutdown_token: CancellationToken) {
    use tokio::signal;

    #[cfg(unix)]
    {
        let (mut sigterm, mut sigint) = match (
            signal::unix::signal(signal::unix::SignalKind::terminate()),
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                shutdown_token.cancel();
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                shutdown_token.cancel();
            }
        }
    }

    #[cfg(windows)]
    {
        match signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                shutdown_token.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    }
}
