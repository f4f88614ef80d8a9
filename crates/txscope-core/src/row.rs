//! Result rows and their column metadata.

use std::sync::Arc;

use crate::error::{Error, QueryErrorKind, Result};
use crate::value::Value;

/// Column names for a result set, shared across all of its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    names: Vec<String>,
}

impl ColumnInfo {
    /// Create column metadata from a list of names.
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Position of a named column.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// All column names, in result-set order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when the result set has no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One result row: shared column metadata plus the cell values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row against shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// The row's column metadata.
    pub fn columns(&self) -> &ColumnInfo {
        &self.columns
    }

    /// Cell at a position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Cell under a column name.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Cell at a position, converted to a concrete Rust type.
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::query(
                QueryErrorKind::Database,
                format!("column index {index} out of range ({} columns)", self.values.len()),
            )
        })?;
        T::from_value(value)
    }

    /// Cell under a column name, converted to a concrete Rust type.
    pub fn get_named_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self.columns.index_of(name).ok_or_else(|| {
            Error::query(QueryErrorKind::Database, format!("no column named {name:?}"))
        })?;
        self.get_as(index)
    }

    /// All cell values, in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Conversion from a dynamically typed [`Value`] into a concrete Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn conversion_error(value: &Value, target: &str) -> Error {
    Error::query(
        QueryErrorKind::Database,
        format!("cannot read {value:?} as {target}"),
    )
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| conversion_error(value, "i64"))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(v) => Ok(*v),
            _ => Err(conversion_error(value, "i32")),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| conversion_error(value, "bool"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| conversion_error(value, "f64"))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| conversion_error(value, "String"))
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
