use pg2events_lib::{load_config_from_env, run_events_app, EventHandler, LoggingHandler};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Main entry point: logs every change of the configured tables
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    tracing::info!("Starting PostgreSQL change events application");

    // Load configuration from environment variables
    let config = load_config_from_env()?;
    if config.tables.is_empty() {
        tracing::warn!("CDC_TABLES is empty, no handler will be registered");
    }

    run_events_app(config, |table| -> Arc<dyn EventHandler> {
        Arc::new(LoggingHandler::new(table))
    })
    .await?;

    tracing::info!("Change events application stopped");
    Ok(())
}

/// Initialize logging
///
/// The log level can be controlled via the `RUST_LOG` environment variable.
///
/// # Default Log Level
///
/// If `RUST_LOG` is not set, defaults to:
/// - `pg2events=debug` - Debug level for the binary
/// - `pg2events_lib=debug` - Debug level for the library
/// - `tokio_postgres=info` - Info level for PostgreSQL client
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("pg2events=debug,pg2events_lib=debug,tokio_postgres=info")
    });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized with level filtering");
}
