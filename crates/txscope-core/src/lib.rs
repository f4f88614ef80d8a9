//! Core types and traits for txscope.
//!
//! `txscope-core` is the **foundation layer** for the workspace. It defines the
//! traits and core data types every other crate builds on.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: `Connection` is the trait implemented by database
//!   drivers; `Model` is the explicit row-to-struct mapping contract.
//! - **Data model**: `Row` and `Value` represent statement inputs/outputs and
//!   are shared across the pool, session, and driver crates.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync
//!   so every async database operation is cancel-correct and budget-aware.
//!
//! # Who Uses This Crate
//!
//! - `txscope-pool` depends on `Connection` for pooled hand-out.
//! - `txscope-session` depends on `Connection`, `Row`, `Value`, and `Model`
//!   for its transaction scope and CRUD helpers.
//! - Driver crates (`txscope-memory`) implement `Connection` and operate on
//!   `Row`/`Value`.
//!
//! Most applications should use the `txscope` facade; reach for `txscope-core`
//! directly when writing drivers or advanced integrations.

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod config;
pub mod connection;
pub mod error;
pub mod identifiers;
pub mod model;
pub mod row;
pub mod value;

pub use config::DbConfig;
pub use connection::{Connection, IsolationLevel};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind, QueryError,
    QueryErrorKind, Result, SessionError, SessionErrorKind,
};
pub use identifiers::{check_identifier, is_safe_identifier, quote_ident};
pub use model::{Model, SoftDelete, Timestamps, now_micros};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
