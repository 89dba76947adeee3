//! Partition resolution
//!
//! A resolver maps a change record to one of the `[0, partition_count)` lanes
//! of its table. Records that resolve to the same lane are handled in order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::types::ChangeRecord;

/// Maps a record to a partition index in `[0, partition_count)`
pub trait PartitionResolver: Send + Sync {
    fn resolve(&self, partition_count: usize, record: &ChangeRecord) -> usize;
}

/// Sends every record to partition 0
#[derive(Debug, Default, Clone, Copy)]
pub struct SinglePartitionResolver;

impl PartitionResolver for SinglePartitionResolver {
    fn resolve(&self, _partition_count: usize, _record: &ChangeRecord) -> usize {
        0
    }
}

/// Source of primary-key column names per table
pub trait PrimaryKeyProvider: Send + Sync {
    /// Ordered primary-key columns of `table`, empty when unknown
    fn primary_keys(&self, table: &str) -> Vec<String>;
}

/// In-memory key schema, filled by hand or from the catalog
#[derive(Debug, Default)]
pub struct StaticPrimaryKeyProvider {
    keys: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticPrimaryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table<T, I, S>(self, table: T, columns: I) -> Self
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_primary_keys(table, columns);
        self
    }

    pub fn set_primary_keys<T, I, S>(&self, table: T, columns: I)
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = columns.into_iter().map(Into::into).collect();
        // A poisoned lock still holds a consistent map
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.insert(table.into(), columns);
    }
}

impl PrimaryKeyProvider for StaticPrimaryKeyProvider {
    fn primary_keys(&self, table: &str) -> Vec<String> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(table).cloned().unwrap_or_default()
    }
}

/// Routes records by the hash of their primary-key values
///
/// Deletes are keyed on the `before` image and everything else on `after`.
/// Absent keys and absent values hash as NULL, so a record with incomplete key
/// metadata still lands in one fixed partition.
pub struct PrimaryKeyResolver {
    provider: Arc<dyn PrimaryKeyProvider>,
}

impl PrimaryKeyResolver {
    pub fn new(provider: Arc<dyn PrimaryKeyProvider>) -> Self {
        Self { provider }
    }

    /// Combined hash of the key values of `record`
    pub fn key_hash(&self, record: &ChangeRecord) -> i32 {
        let image = record.key_image();
        let keys = self.provider.primary_keys(&record.table);
        list_hash(
            keys.iter()
                .map(|column| image.and_then(|row| row.get(column)).flatten()),
        )
    }
}

impl PartitionResolver for PrimaryKeyResolver {
    fn resolve(&self, partition_count: usize, record: &ChangeRecord) -> usize {
        if partition_count <= 1 {
            return 0;
        }
        floor_mod(self.key_hash(record), partition_count)
    }
}

/// Ordered list hash: `h = 31 * h + hash(value)` starting at 1, NULL hashes to 0
pub fn list_hash<'a, I>(values: I) -> i32
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    values.into_iter().fold(1i32, |acc, value| {
        acc.wrapping_mul(31)
            .wrapping_add(value.map(string_hash).unwrap_or(0))
    })
}

/// 31-multiplier hash over the UTF-16 code units of `value`
pub fn string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |acc, unit| acc.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Non-negative remainder of `hash` by `partition_count`
#[inline]
pub fn floor_mod(hash: i32, partition_count: usize) -> usize {
    (hash as i64).rem_euclid(partition_count as i64) as usize
}
