use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::EventsError;

/// PostgreSQL log sequence number
///
/// Rendered as `X/Y`, the high and low 32 bits in hexadecimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// `0/0`, never a valid WAL position
    pub const INVALID: Lsn = Lsn(0);

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = EventsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| EventsError::decode(format!("Invalid LSN format: '{}'", s)))?;
        let high = u32::from_str_radix(high, 16)
            .map_err(|e| EventsError::decode(format!("Invalid LSN '{}': {}", s, e)))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|e| EventsError::decode(format!("Invalid LSN '{}': {}", s, e)))?;
        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

/// Kind of row-level change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for ChangeKind {
    type Err = EventsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(EventsError::decode(format!("Unknown change kind '{}'", other))),
        }
    }
}

/// Column values of one row image, in column order
///
/// `None` values are SQL NULLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowImage {
    columns: Vec<(String, Option<String>)>,
}

impl RowImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a row image from parallel name/value arrays
    pub fn from_columns<N, V>(names: N, values: V) -> Self
    where
        N: IntoIterator<Item = String>,
        V: IntoIterator<Item = Option<String>>,
    {
        Self {
            columns: names.into_iter().zip(values).collect(),
        }
    }

    pub fn with<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.columns.push((name.into(), Some(value.into())));
        self
    }

    pub fn with_null<K: Into<String>>(mut self, name: K) -> Self {
        self.columns.push((name.into(), None));
        self
    }

    /// Value of a column: `None` if absent, `Some(None)` if NULL
    pub fn get(&self, column: &str) -> Option<Option<&str>> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Serialize for RowImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// One row-level change decoded from the replication stream
///
/// Deletes carry `before` only, inserts carry `after` only and updates carry
/// both when the old key is available (key columns only, not the full old row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<RowImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<RowImage>,
}

impl ChangeRecord {
    pub fn insert<T: Into<String>>(table: T, after: RowImage) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            before: None,
            after: Some(after),
        }
    }

    pub fn update<T: Into<String>>(table: T, before: Option<RowImage>, after: RowImage) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.into(),
            before,
            after: Some(after),
        }
    }

    pub fn delete<T: Into<String>>(table: T, before: RowImage) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            before: Some(before),
            after: None,
        }
    }

    /// Row image that identifies the row: `before` for deletes, `after` otherwise
    pub fn key_image(&self) -> Option<&RowImage> {
        match self.kind {
            ChangeKind::Delete => self.before.as_ref(),
            ChangeKind::Insert | ChangeKind::Update => self.after.as_ref(),
        }
    }
}

/// Ordered changes decoded from one wal2json message
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub records: Vec<Arc<ChangeRecord>>,
    /// `nextlsn` of the message, used to fast-forward a recreated stream
    pub resume_token: Option<Lsn>,
    /// Commit timestamp as emitted by the server
    pub commit_time: Option<String>,
}

impl ChangeBatch {
    pub fn new(records: Vec<ChangeRecord>, resume_token: Option<Lsn>) -> Self {
        Self {
            records: records.into_iter().map(Arc::new).collect(),
            resume_token,
            commit_time: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Raw message read from the replication stream
#[derive(Debug, Clone)]
pub struct ReplicationEvent {
    pub message: String,
    pub read_time: DateTime<Utc>,
    pub received_position: Lsn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_round_trip_format() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16u64 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(Lsn::INVALID.to_string(), "0/0");
        assert!(!Lsn::INVALID.is_valid());
    }

    #[test]
    fn test_lsn_rejects_garbage() {
        assert!("16B374D848".parse::<Lsn>().is_err());
        assert!("zz/1".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_change_kind_is_case_insensitive() {
        assert_eq!("INSERT".parse::<ChangeKind>().unwrap(), ChangeKind::Insert);
        assert_eq!("Update".parse::<ChangeKind>().unwrap(), ChangeKind::Update);
        assert!("truncate".parse::<ChangeKind>().is_err());
    }

    #[test]
    fn test_key_image_selection() {
        let before = RowImage::new().with("id", "1");
        let after = RowImage::new().with("id", "1").with("name", "a");

        let delete = ChangeRecord::delete("t", before.clone());
        assert_eq!(delete.key_image(), Some(&before));

        let update = ChangeRecord::update("t", Some(before), after.clone());
        assert_eq!(update.key_image(), Some(&after));
    }

    #[test]
    fn test_row_image_preserves_order_and_nulls() {
        let row = RowImage::new().with("b", "2").with_null("a");
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(row.get("a"), Some(None));
        assert_eq!(row.get("b"), Some(Some("2")));
        assert_eq!(row.get("c"), None);

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"b":"2","a":null}"#);
    }
}
