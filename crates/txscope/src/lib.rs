//! Request-scoped transactional database session management.
//!
//! `txscope` binds each unit of work to exactly one database session for its
//! lifetime: the session runs inside a transaction that commits on success
//! and rolls back on any failure, and concurrent requests never share or
//! leak sessions.
//!
//! # Architecture
//!
//! - [`txscope_core`] — foundation types: [`Connection`], [`Value`], [`Row`],
//!   [`Model`], [`DbConfig`], and the error taxonomy.
//! - [`txscope_pool`] — the bounded connection [`Pool`] with exclusive
//!   hand-out and release-on-drop guards.
//! - [`txscope_session`] — [`Session`], [`RequestContext`], and
//!   [`SessionScope`], the transaction scope manager.
//! - Driver crates (`txscope-memory`, and whatever implements
//!   [`Connection`] for your database) plug in underneath.
//!
//! # Example
//!
//! ```ignore
//! use txscope::prelude::*;
//!
//! let pool = Pool::new(PoolConfig::from(&config));
//! let scope = SessionScope::new(pool);
//! let mut ctx = RequestContext::new(RequestId::new(header_request_id));
//!
//! let id = scope
//!     .with_transaction(&cx, &mut ctx, connect, async |session| {
//!         session.add(&cx, &note).await
//!     })
//!     .await?;
//! ```

pub use txscope_core::{
    Budget, ColumnInfo, Connection, ConnectionError, ConnectionErrorKind, Cx, DbConfig, Error,
    FromValue, IsolationLevel, Model, Outcome, PoolError, PoolErrorKind, QueryError,
    QueryErrorKind, RegionId, Result, Row, SessionError, SessionErrorKind, SoftDelete, TaskId,
    Timestamps, Value, check_identifier, is_safe_identifier, now_micros, quote_ident,
};
pub use txscope_pool::{Pool, PoolConfig, PoolStats, PooledConnection};
pub use txscope_session::{
    RequestContext, RequestId, ScopeConfig, ScopeStats, Session, SessionId, SessionScope, TxState,
};

/// Everything a request handler typically needs.
pub mod prelude {
    pub use txscope_core::{
        Connection, Cx, DbConfig, Error, IsolationLevel, Model, Outcome, Result, Row, SoftDelete,
        Timestamps, Value,
    };
    pub use txscope_pool::{Pool, PoolConfig, PooledConnection};
    pub use txscope_session::{
        RequestContext, RequestId, ScopeConfig, Session, SessionId, SessionScope, TxState,
    };
}
