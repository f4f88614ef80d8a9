//! Explicit schema-to-struct mapping.
//!
//! There is no derive macro and no runtime class building here: a model
//! states its table metadata as consts and writes its own `from_row` /
//! `to_values` conversions. The session layer uses that metadata to build
//! CRUD statements.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// A struct mapped to one database table.
pub trait Model: Sized + Send + Sync {
    /// Table name. Must be a plain identifier; the session layer validates
    /// and quotes it before it reaches statement text.
    const TABLE_NAME: &'static str;

    /// Column names, in `to_values` order.
    const COLUMNS: &'static [&'static str];

    /// Primary key column(s). The CRUD helpers use the first entry.
    const PRIMARY_KEY: &'static [&'static str];

    /// Build an instance from a result row.
    fn from_row(row: &Row) -> Result<Self>;

    /// The instance's column values, in `COLUMNS` order.
    fn to_values(&self) -> Vec<Value>;

    /// The instance's primary key value.
    fn primary_key_value(&self) -> Value;
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Embeddable creation/update timestamps.
///
/// ```ignore
/// struct Example {
///     id: i64,
///     name: String,
///     stamps: Timestamps,
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    /// Set once, at creation.
    pub created_at: i64,
    /// Set on every update; `None` until the first one.
    pub updated_at: Option<i64>,
}

impl Timestamps {
    /// Fresh timestamps for a newly created record.
    pub fn now() -> Self {
        Self {
            created_at: now_micros(),
            updated_at: None,
        }
    }

    /// Record an update.
    pub fn touch(&mut self) {
        self.updated_at = Some(now_micros());
    }
}

impl Default for Timestamps {
    fn default() -> Self {
        Self::now()
    }
}

/// Embeddable soft-delete marker.
///
/// Instead of deleting rows, records are flagged with a deletion timestamp
/// and filtered out of active-row queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SoftDelete {
    /// When the record was soft-deleted.
    pub deleted_at: Option<i64>,
    /// Deletion flag, kept alongside the timestamp for cheap filtering.
    pub is_deleted: bool,
}

impl SoftDelete {
    /// Mark the record deleted.
    pub fn soft_delete(&mut self) {
        self.is_deleted = true;
        self.deleted_at = Some(now_micros());
    }

    /// Restore a soft-deleted record.
    pub fn restore(&mut self) {
        self.is_deleted = false;
        self.deleted_at = None;
    }

    /// True when the record has not been soft-deleted.
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::ColumnInfo;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Example {
        id: i64,
        name: String,
    }

    impl Model for Example {
        const TABLE_NAME: &'static str = "example";
        const COLUMNS: &'static [&'static str] = &["id", "name"];
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named_as("id")?,
                name: row.get_named_as("name")?,
            })
        }

        fn to_values(&self) -> Vec<Value> {
            vec![Value::BigInt(self.id), Value::Text(self.name.clone())]
        }

        fn primary_key_value(&self) -> Value {
            Value::BigInt(self.id)
        }
    }

    #[test]
    fn model_roundtrips_through_row() {
        let columns = Arc::new(ColumnInfo::new(vec!["id".into(), "name".into()]));
        let original = Example {
            id: 3,
            name: "widget".into(),
        };
        let row = Row::with_columns(Arc::clone(&columns), original.to_values());
        let back = Example::from_row(&row).expect("from_row");
        assert_eq!(back, original);
    }

    #[test]
    fn timestamps_touch_sets_updated_at() {
        let mut stamps = Timestamps::now();
        assert!(stamps.updated_at.is_none());
        stamps.touch();
        let updated = stamps.updated_at.expect("updated_at set");
        assert!(updated >= stamps.created_at);
    }

    #[test]
    fn soft_delete_and_restore() {
        let mut marker = SoftDelete::default();
        assert!(marker.is_active());

        marker.soft_delete();
        assert!(!marker.is_active());
        assert!(marker.deleted_at.is_some());

        marker.restore();
        assert!(marker.is_active());
        assert!(marker.deleted_at.is_none());
    }
}
