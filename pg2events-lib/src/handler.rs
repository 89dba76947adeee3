use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::types::ChangeRecord;

/// Application callback for change records
///
/// Handlers of one queue see its records in order. A failed record is logged
/// and reported to statistics, never retried and never surfaced to the producer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and per-handler statistics
    fn name(&self) -> &str;

    async fn handle(&self, record: &ChangeRecord) -> Result<()>;
}

/// Logs every record as a JSON line
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    name: String,
}

impl LoggingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self::new("logging")
    }
}

#[async_trait]
impl EventHandler for LoggingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, record: &ChangeRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        info!(handler = %self.name, table = %record.table, kind = %record.kind, "{}", payload);
        Ok(())
    }
}

/// Handler backed by a synchronous closure
pub struct FnHandler<F> {
    name: String,
    callback: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&ChangeRecord) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&ChangeRecord) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, record: &ChangeRecord) -> Result<()> {
        (self.callback)(record)
    }
}
