//! wal2json message decoding

use serde::Deserialize;
use serde_json::Value;

use crate::error::{EventsError, Result};
use crate::types::{ChangeBatch, ChangeKind, ChangeRecord, Lsn, RowImage};

/// Turns raw replication messages into change batches
pub trait MessageDecoder: Send + Sync {
    /// Cheap structural check; `false` for keep-alive messages with an empty change list
    fn has_changes(&self, raw: &str) -> bool;

    fn decode(&self, raw: &str) -> Result<ChangeBatch>;
}

#[derive(Debug, Deserialize)]
struct Wal2JsonMessage {
    #[serde(default)]
    nextlsn: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    change: Vec<Wal2JsonChange>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    kind: String,
    table: String,
    #[serde(default)]
    columnnames: Option<Vec<String>>,
    #[serde(default)]
    columnvalues: Option<Vec<Value>>,
    #[serde(default)]
    oldkeys: Option<Wal2JsonOldKeys>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonOldKeys {
    keynames: Vec<String>,
    keyvalues: Vec<Value>,
}

/// Decoder for the wal2json format-version 1 output
#[derive(Debug, Default, Clone, Copy)]
pub struct Wal2JsonDecoder;

impl Wal2JsonDecoder {
    pub fn new() -> Self {
        Self
    }

    fn convert(change: Wal2JsonChange) -> Result<ChangeRecord> {
        let kind: ChangeKind = change.kind.parse()?;

        let after = match (change.columnnames, change.columnvalues) {
            (Some(names), Some(values)) => Some(row_image(&change.table, names, values)?),
            _ => None,
        };
        let before = change
            .oldkeys
            .map(|old| row_image(&change.table, old.keynames, old.keyvalues))
            .transpose()?;

        Ok(ChangeRecord {
            kind,
            table: change.table,
            before,
            after,
        })
    }
}

fn row_image(table: &str, names: Vec<String>, values: Vec<Value>) -> Result<RowImage> {
    if names.len() != values.len() {
        return Err(EventsError::decode(format!(
            "Column count mismatch for '{}': {} names, {} values",
            table,
            names.len(),
            values.len()
        )));
    }
    Ok(RowImage::from_columns(names, values.into_iter().map(column_value)))
}

fn column_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl MessageDecoder for Wal2JsonDecoder {
    fn has_changes(&self, raw: &str) -> bool {
        let Some(index) = raw.find("\"change\"") else {
            return true;
        };
        let mut rest = raw[index + "\"change\"".len()..].trim_start();
        for expected in [':', '['] {
            match rest.strip_prefix(expected) {
                Some(tail) => rest = tail.trim_start(),
                None => return true,
            }
        }
        !rest.starts_with(']')
    }

    fn decode(&self, raw: &str) -> Result<ChangeBatch> {
        let message: Wal2JsonMessage = serde_json::from_str(raw)?;

        let resume_token = message
            .nextlsn
            .as_deref()
            .map(str::parse::<Lsn>)
            .transpose()?;
        let records = message
            .change
            .into_iter()
            .map(Self::convert)
            .collect::<Result<Vec<_>>>()?;

        let mut batch = ChangeBatch::new(records, resume_token);
        batch.commit_time = message.timestamp;
        Ok(batch)
    }
}
