//! Request-scoped transactional sessions.
//!
//! A [`Session`] is one unit of work against the database: exactly one pooled
//! connection and exactly one transaction, owned by a single request flow for
//! its entire lifetime. [`SessionScope::with_transaction`] is the only
//! intended way to run one: it guarantees commit-on-success and
//! rollback-on-failure with the connection released on every exit path.
//!
//! # Design Philosophy
//!
//! - **Explicit over ambient**: the session and its [`RequestContext`] are
//!   threaded through the call chain as values. There is no task-local
//!   registry to consult and none to leak.
//! - **Ownership clarity**: the session owns its connection; the scope owns
//!   the session; the borrow checker enforces that neither outlives the
//!   request flow.
//! - **Transaction safety**: a session's state only moves forward
//!   (`Idle → Active → {Committed, RolledBack} → Closed`), and every
//!   statement is gated on `Active`.
//!
//! # Example
//!
//! ```ignore
//! let scope = SessionScope::new(pool);
//! let mut ctx = RequestContext::new(RequestId::new("req-7d2f"));
//!
//! let hero_id = scope
//!     .with_transaction(&cx, &mut ctx, connect, async |session| {
//!         session.add(&cx, &hero).await
//!     })
//!     .await?;
//! // Committed on success, rolled back on any failure.
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use asupersync::{Cx, Outcome};
use txscope_core::error::{Error, SessionErrorKind};
use txscope_core::{Connection, IsolationLevel, Model, Value, check_identifier, quote_ident};
use txscope_pool::PooledConnection;

pub mod context;
pub mod scope;

pub use context::{RequestContext, RequestId};
pub use scope::{ScopeConfig, ScopeStats, SessionScope};

// ============================================================================
// Session identity
// ============================================================================

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier, used for context binding and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

// ============================================================================
// Transaction state machine
// ============================================================================

/// Lifecycle of a session's transaction.
///
/// States only move forward; no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Constructed; `BEGIN` not yet issued.
    Idle,
    /// Transaction open; statements allowed.
    Active,
    /// `COMMIT` succeeded.
    Committed,
    /// Rollback was initiated (whether or not the `ROLLBACK` statement
    /// itself succeeded; a failed rollback retires the connection).
    RolledBack,
    /// Finalized; the connection has left the session.
    Closed,
}

// ============================================================================
// Session
// ============================================================================

/// One database session: a pooled connection plus one transaction.
///
/// Exclusively owned by the request flow that created it; never shared across
/// requests and never retained past the request's completion.
pub struct Session<C: Connection> {
    id: SessionId,
    request_id: RequestId,
    conn: Option<PooledConnection<C>>,
    state: TxState,
    statements: u64,
}

impl<C: Connection> Session<C> {
    /// Wrap a pooled connection into a fresh `Idle` session.
    pub fn new(request_id: RequestId, conn: PooledConnection<C>) -> Self {
        Self {
            id: SessionId::next(),
            request_id,
            conn: Some(conn),
            state: TxState::Idle,
            statements: 0,
        }
    }

    /// The session's identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The request this session belongs to.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Current transaction state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of statements issued through this session.
    pub fn statements(&self) -> u64 {
        self.statements
    }

    fn require_state(&self, expected: TxState, doing: &str) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::session(
                SessionErrorKind::InvalidState,
                format!("cannot {doing} in state {:?}", self.state),
            ))
        }
    }

    fn connection(&self) -> Result<&PooledConnection<C>, Error> {
        self.conn.as_ref().ok_or_else(|| {
            Error::session(
                SessionErrorKind::InvalidState,
                "session connection already released",
            )
        })
    }

    // ========================================================================
    // Transaction control
    // ========================================================================

    /// Open the transaction.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.begin_with(cx, None).await
    }

    /// Open the transaction, optionally raising the isolation level.
    pub async fn begin_with(
        &mut self,
        cx: &Cx,
        isolation: Option<IsolationLevel>,
    ) -> Outcome<(), Error> {
        if let Err(e) = self.require_state(TxState::Idle, "begin a transaction") {
            return Outcome::Err(e);
        }

        {
            let conn = match self.connection() {
                Ok(c) => c,
                Err(e) => return Outcome::Err(e),
            };
            match conn.execute(cx, "BEGIN", &[]).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.state = TxState::Active;

        if let Some(level) = isolation {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            let conn = match self.connection() {
                Ok(c) => c,
                Err(e) => return Outcome::Err(e),
            };
            match conn.execute(cx, &sql, &[]).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::debug!(session = %self.id, request = %self.request_id, "transaction opened");
        Outcome::Ok(())
    }

    /// Commit the transaction.
    ///
    /// On failure the session stays `Active` so a rollback can still run.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.require_state(TxState::Active, "commit") {
            return Outcome::Err(e);
        }
        let conn = match self.connection() {
            Ok(c) => c,
            Err(e) => return Outcome::Err(e),
        };
        match conn.execute(cx, "COMMIT", &[]).await {
            Outcome::Ok(_) => {
                self.state = TxState::Committed;
                tracing::debug!(
                    session = %self.id,
                    statements = self.statements,
                    "transaction committed"
                );
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Roll the transaction back, discarding uncommitted writes.
    ///
    /// The state moves to `RolledBack` whether or not the statement succeeds;
    /// a failed rollback means the connection must not be reused, which
    /// [`Session::discard`] handles.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.require_state(TxState::Active, "roll back") {
            return Outcome::Err(e);
        }
        self.state = TxState::RolledBack;
        let conn = match self.connection() {
            Ok(c) => c,
            Err(e) => return Outcome::Err(e),
        };
        match conn.execute(cx, "ROLLBACK", &[]).await {
            Outcome::Ok(_) => {
                tracing::debug!(session = %self.id, "transaction rolled back");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Finalize the session and return its connection to the pool.
    pub fn finish(mut self) {
        self.state = TxState::Closed;
        drop(self.conn.take());
    }

    /// Finalize the session and retire its connection instead of pooling it.
    pub fn discard(mut self) {
        self.state = TxState::Closed;
        if let Some(conn) = self.conn.take() {
            conn.discard();
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Run a parameterized query and return all rows.
    pub async fn query(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<txscope_core::Row>, Error> {
        if let Err(e) = self.require_state(TxState::Active, "query") {
            return Outcome::Err(e);
        }
        self.statements += 1;
        let conn = match self.connection() {
            Ok(c) => c,
            Err(e) => return Outcome::Err(e),
        };
        conn.query(cx, sql, params).await
    }

    /// Run a parameterized query expected to produce at most one row.
    pub async fn query_one(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<txscope_core::Row>, Error> {
        if let Err(e) = self.require_state(TxState::Active, "query") {
            return Outcome::Err(e);
        }
        self.statements += 1;
        let conn = match self.connection() {
            Ok(c) => c,
            Err(e) => return Outcome::Err(e),
        };
        conn.query_one(cx, sql, params).await
    }

    /// Execute a statement and return the number of rows affected.
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        if let Err(e) = self.require_state(TxState::Active, "execute") {
            return Outcome::Err(e);
        }
        self.statements += 1;
        let conn = match self.connection() {
            Ok(c) => c,
            Err(e) => return Outcome::Err(e),
        };
        conn.execute(cx, sql, params).await
    }

    /// Execute an INSERT and return the generated id.
    pub async fn insert(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<i64, Error> {
        if let Err(e) = self.require_state(TxState::Active, "insert") {
            return Outcome::Err(e);
        }
        self.statements += 1;
        let conn = match self.connection() {
            Ok(c) => c,
            Err(e) => return Outcome::Err(e),
        };
        conn.insert(cx, sql, params).await
    }

    // ========================================================================
    // Model CRUD helpers
    // ========================================================================

    /// INSERT a model instance and return its generated id.
    #[tracing::instrument(level = "debug", skip(self, cx, obj), fields(session = %self.id, table = M::TABLE_NAME))]
    pub async fn add<M: Model>(&mut self, cx: &Cx, obj: &M) -> Outcome<i64, Error> {
        let sql = match insert_sql::<M>() {
            Ok(sql) => sql,
            Err(e) => return Outcome::Err(e),
        };
        self.insert(cx, &sql, &obj.to_values()).await
    }

    /// Fetch a model instance by primary key.
    #[tracing::instrument(level = "debug", skip(self, cx, pk), fields(session = %self.id, table = M::TABLE_NAME))]
    pub async fn get<M: Model>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
    ) -> Outcome<Option<M>, Error> {
        let sql = match select_by_pk_sql::<M>() {
            Ok(sql) => sql,
            Err(e) => return Outcome::Err(e),
        };
        let row = match self.query_one(cx, &sql, &[pk.into()]).await {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match row {
            Some(row) => match M::from_row(&row) {
                Ok(obj) => Outcome::Ok(Some(obj)),
                Err(e) => Outcome::Err(e),
            },
            None => Outcome::Ok(None),
        }
    }

    /// Fetch all rows of a model's table.
    pub async fn all<M: Model>(&mut self, cx: &Cx) -> Outcome<Vec<M>, Error> {
        let sql = match table_sql::<M>(None) {
            Ok(sql) => sql,
            Err(e) => return Outcome::Err(e),
        };
        self.collect_rows(cx, &sql, &[]).await
    }

    /// Fetch rows matching a single column predicate.
    pub async fn find_where<M: Model>(
        &mut self,
        cx: &Cx,
        column: &str,
        value: impl Into<Value>,
    ) -> Outcome<Vec<M>, Error> {
        let sql = match table_sql::<M>(Some(column)) {
            Ok(sql) => sql,
            Err(e) => return Outcome::Err(e),
        };
        self.collect_rows(cx, &sql, &[value.into()]).await
    }

    /// UPDATE a model instance's non-key columns by primary key, returning
    /// the affected count.
    #[tracing::instrument(level = "debug", skip(self, cx, obj), fields(session = %self.id, table = M::TABLE_NAME))]
    pub async fn update<M: Model>(&mut self, cx: &Cx, obj: &M) -> Outcome<u64, Error> {
        let sql = match update_by_pk_sql::<M>() {
            Ok(sql) => sql,
            Err(e) => return Outcome::Err(e),
        };
        let pk = M::PRIMARY_KEY.first().copied().unwrap_or("id");
        let mut params: Vec<Value> = M::COLUMNS
            .iter()
            .zip(obj.to_values())
            .filter(|(col, _)| **col != pk)
            .map(|(_, value)| value)
            .collect();
        params.push(obj.primary_key_value());
        self.execute(cx, &sql, &params).await
    }

    /// DELETE a model instance by primary key, returning the affected count.
    #[tracing::instrument(level = "debug", skip(self, cx, obj), fields(session = %self.id, table = M::TABLE_NAME))]
    pub async fn remove<M: Model>(&mut self, cx: &Cx, obj: &M) -> Outcome<u64, Error> {
        let sql = match delete_by_pk_sql::<M>() {
            Ok(sql) => sql,
            Err(e) => return Outcome::Err(e),
        };
        self.execute(cx, &sql, &[obj.primary_key_value()]).await
    }

    async fn collect_rows<M: Model>(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<M>, Error> {
        let rows = match self.query(cx, sql, params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match M::from_row(row) {
                Ok(obj) => out.push(obj),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(out)
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            // The scope normally finalizes before drop; reaching here means
            // the request flow was torn down mid-transaction. No rollback can
            // run from a destructor, so the connection is retired instead of
            // returned to the idle set with a transaction still open.
            tracing::warn!(
                session = %self.id,
                request = %self.request_id,
                "session dropped while its transaction was still active; retiring connection"
            );
            if let Some(conn) = self.conn.take() {
                conn.discard();
            }
        }
    }
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("statements", &self.statements)
            .finish()
    }
}

// ============================================================================
// Statement building
// ============================================================================

fn checked_table_and_pk<M: Model>() -> Result<(String, String), Error> {
    check_identifier(M::TABLE_NAME)?;
    let pk = M::PRIMARY_KEY.first().copied().unwrap_or("id");
    check_identifier(pk)?;
    Ok((quote_ident(M::TABLE_NAME), quote_ident(pk)))
}

fn insert_sql<M: Model>() -> Result<String, Error> {
    check_identifier(M::TABLE_NAME)?;
    let mut columns = Vec::with_capacity(M::COLUMNS.len());
    for col in M::COLUMNS {
        check_identifier(col)?;
        columns.push(quote_ident(col));
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(M::TABLE_NAME),
        columns.join(", "),
        placeholders.join(", ")
    ))
}

fn select_by_pk_sql<M: Model>() -> Result<String, Error> {
    let (table, pk) = checked_table_and_pk::<M>()?;
    Ok(format!("SELECT * FROM {table} WHERE {pk} = $1 LIMIT 1"))
}

fn table_sql<M: Model>(filter_column: Option<&str>) -> Result<String, Error> {
    check_identifier(M::TABLE_NAME)?;
    let table = quote_ident(M::TABLE_NAME);
    match filter_column {
        Some(col) => {
            check_identifier(col)?;
            Ok(format!("SELECT * FROM {table} WHERE {} = $1", quote_ident(col)))
        }
        None => Ok(format!("SELECT * FROM {table}")),
    }
}

fn delete_by_pk_sql<M: Model>() -> Result<String, Error> {
    let (table, pk) = checked_table_and_pk::<M>()?;
    Ok(format!("DELETE FROM {table} WHERE {pk} = $1"))
}

fn update_by_pk_sql<M: Model>() -> Result<String, Error> {
    let (table, pk_quoted) = checked_table_and_pk::<M>()?;
    let pk = M::PRIMARY_KEY.first().copied().unwrap_or("id");

    let mut assignments = Vec::with_capacity(M::COLUMNS.len().saturating_sub(1));
    for col in M::COLUMNS.iter().filter(|col| **col != pk) {
        check_identifier(col)?;
        assignments.push(format!("{} = ${}", quote_ident(col), assignments.len() + 1));
    }
    if assignments.is_empty() {
        return Err(Error::session(
            SessionErrorKind::InvalidState,
            format!("model {:?} has no non-key columns to update", M::TABLE_NAME),
        ));
    }

    Ok(format!(
        "UPDATE {table} SET {} WHERE {pk_quoted} = ${}",
        assignments.join(", "),
        assignments.len() + 1
    ))
}
