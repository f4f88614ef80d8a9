//! The shared store and its connections.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{Cx, Outcome};
use txscope_core::error::{Error, QueryErrorKind};
use txscope_core::{ColumnInfo, Connection, Result, Row, Value};

use crate::statement::{Predicate, Statement, parse};

const ID_COLUMN: &str = "id";

// ============================================================================
// Shared store
// ============================================================================

struct Table {
    columns: Arc<ColumnInfo>,
    rows: Vec<Row>,
    next_id: i64,
}

struct DbInner {
    tables: Mutex<HashMap<String, Table>>,
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
}

/// A shared in-memory database. Cloning yields another handle to the same
/// committed store.
#[derive(Clone)]
pub struct MemDb {
    inner: Arc<DbInner>,
}

impl MemDb {
    /// An empty database.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DbInner {
                tables: Mutex::new(HashMap::new()),
                fail_next_commit: AtomicBool::new(false),
                fail_next_rollback: AtomicBool::new(false),
            }),
        }
    }

    /// Define a table. An `id` column, when present, auto-increments for
    /// inserts that omit it or bind it to NULL.
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        let mut tables = lock(&self.inner.tables);
        tables.insert(
            name.to_string(),
            Table {
                columns: Arc::new(ColumnInfo::new(
                    columns.iter().map(|c| (*c).to_string()).collect(),
                )),
                rows: Vec::new(),
                next_id: 1,
            },
        );
    }

    /// Open a connection to this database.
    pub fn connect(&self) -> MemConnection {
        MemConnection {
            db: self.clone(),
            tx: Mutex::new(None),
        }
    }

    /// Number of committed rows in a table. Test convenience; uncommitted
    /// writes are invisible here by construction.
    pub fn committed_count(&self, table: &str) -> usize {
        lock(&self.inner.tables)
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Make the next `COMMIT` on any connection fail with a constraint
    /// error, the way a deferred constraint violation surfaces.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next `ROLLBACK` on any connection fail.
    pub fn fail_next_rollback(&self) {
        self.inner.fail_next_rollback.store(true, Ordering::SeqCst);
    }
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = lock(&self.inner.tables);
        f.debug_struct("MemDb").field("tables", &tables.len()).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Transaction buffer
// ============================================================================

/// `"column" = value`, resolved against bind parameters at issue time.
type ResolvedPredicate = Option<(String, Value)>;

/// One buffered write. Ops replay in issue order, both for in-transaction
/// reads and when the buffer is committed to the store.
enum Op {
    Insert(Row),
    Update {
        predicate: ResolvedPredicate,
        /// Column index paired with the value to assign.
        assignments: Vec<(usize, Value)>,
    },
    Delete(ResolvedPredicate),
}

/// Buffered, not-yet-committed writes of one connection.
#[derive(Default)]
struct TxBuffer {
    ops: Vec<(String, Op)>,
}

fn matches(columns: &ColumnInfo, row: &Row, predicate: &ResolvedPredicate) -> bool {
    match predicate {
        Some((column, value)) => columns
            .index_of(column)
            .is_some_and(|idx| row.get(idx) == Some(value)),
        None => true,
    }
}

/// Apply one op to a row set.
fn apply_op(columns: &Arc<ColumnInfo>, rows: &mut Vec<Row>, op: &Op) {
    match op {
        Op::Insert(row) => rows.push(row.clone()),
        Op::Update {
            predicate,
            assignments,
        } => {
            for row in rows.iter_mut() {
                if matches(columns, row, predicate) {
                    let mut values = row.values().to_vec();
                    for (idx, value) in assignments {
                        values[*idx] = value.clone();
                    }
                    *row = Row::with_columns(Arc::clone(columns), values);
                }
            }
        }
        Op::Delete(predicate) => rows.retain(|row| !matches(columns, row, predicate)),
    }
}

/// The rows of `table_name` as this transaction sees them: the committed
/// store with the buffer's ops replayed on top.
fn visible_rows(table_name: &str, table: &Table, buffer: Option<&TxBuffer>) -> Vec<Row> {
    let mut rows = table.rows.clone();
    if let Some(buffer) = buffer {
        for (name, op) in &buffer.ops {
            if name == table_name {
                apply_op(&table.columns, &mut rows, op);
            }
        }
    }
    rows
}

// ============================================================================
// Connection
// ============================================================================

/// One connection to a [`MemDb`].
///
/// Reads see the committed store plus this connection's own uncommitted
/// writes; other connections' buffers are invisible.
pub struct MemConnection {
    db: MemDb,
    tx: Mutex<Option<TxBuffer>>,
}

struct ExecResult {
    rows: Vec<Row>,
    affected: u64,
    last_id: i64,
}

fn done(affected: u64) -> ExecResult {
    ExecResult {
        rows: Vec::new(),
        affected,
        last_id: 0,
    }
}

impl MemConnection {
    fn run_outcome(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<ExecResult, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        match self.run(sql, params) {
            Ok(result) => Outcome::Ok(result),
            Err(e) => Outcome::Err(e),
        }
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        match parse(sql)? {
            Statement::Begin => {
                let mut tx = lock(&self.tx);
                if tx.is_some() {
                    return Err(Error::query(
                        QueryErrorKind::Database,
                        "transaction already open",
                    ));
                }
                *tx = Some(TxBuffer::default());
                Ok(done(0))
            }
            Statement::Commit => self.commit(),
            Statement::Rollback => self.rollback(),
            Statement::SetTransaction => Ok(done(0)),
            Statement::Insert { table, columns } => self.insert_row(&table, &columns, params),
            Statement::Update {
                table,
                assignments,
                predicate,
            } => self.write_op(&table, predicate.as_ref(), params, |table, resolved| {
                let mut resolved_assignments = Vec::with_capacity(assignments.len());
                for (column, param_idx) in &assignments {
                    let idx = table
                        .columns
                        .index_of(column)
                        .ok_or_else(|| no_such_column_err(column))?;
                    let value = params
                        .get(*param_idx)
                        .cloned()
                        .ok_or_else(|| missing_param(*param_idx))?;
                    resolved_assignments.push((idx, value));
                }
                Ok(Op::Update {
                    predicate: resolved,
                    assignments: resolved_assignments,
                })
            }),
            Statement::Delete { table, predicate } => self
                .write_op(&table, predicate.as_ref(), params, |_table, resolved| {
                    Ok(Op::Delete(resolved))
                }),
            Statement::Select {
                table,
                predicate,
                limit,
            } => self.select_rows(&table, predicate.as_ref(), limit, params),
        }
    }

    fn commit(&self) -> Result<ExecResult> {
        if self.db.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::query(
                QueryErrorKind::Constraint,
                "commit rejected: deferred constraint violation",
            ));
        }
        let buffer = lock(&self.tx).take();
        if let Some(buffer) = buffer {
            let mut tables = lock(&self.db.inner.tables);
            let applied = buffer.ops.len();
            for (table_name, op) in &buffer.ops {
                if let Some(table) = tables.get_mut(table_name) {
                    let columns = Arc::clone(&table.columns);
                    apply_op(&columns, &mut table.rows, op);
                }
            }
            tracing::debug!(applied, "transaction committed to store");
        }
        Ok(done(0))
    }

    fn rollback(&self) -> Result<ExecResult> {
        if self.db.inner.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(Error::query(
                QueryErrorKind::Database,
                "rollback failed: connection left in an unusable state",
            ));
        }
        drop(lock(&self.tx).take());
        Ok(done(0))
    }

    fn insert_row(
        &self,
        table_name: &str,
        columns: &[(String, usize)],
        params: &[Value],
    ) -> Result<ExecResult> {
        let mut tables = lock(&self.db.inner.tables);
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| no_such_table(table_name))?;

        let mut values = vec![Value::Null; table.columns.len()];
        for (column, param_idx) in columns {
            let column_idx = table
                .columns
                .index_of(column)
                .ok_or_else(|| no_such_column(table_name, column))?;
            values[column_idx] = params
                .get(*param_idx)
                .cloned()
                .ok_or_else(|| missing_param(*param_idx))?;
        }

        // Auto-increment the id column when it was omitted or bound to NULL.
        let mut last_id = 0;
        if let Some(id_idx) = table.columns.index_of(ID_COLUMN) {
            if values[id_idx].is_null() {
                last_id = table.next_id;
                table.next_id += 1;
                values[id_idx] = Value::BigInt(last_id);
            } else if let Some(explicit) = values[id_idx].as_i64() {
                table.next_id = table.next_id.max(explicit + 1);
                last_id = explicit;
            }
        }

        let row = Row::with_columns(Arc::clone(&table.columns), values);

        let mut tx = lock(&self.tx);
        match (*tx).as_mut() {
            Some(buffer) => buffer.ops.push((table_name.to_string(), Op::Insert(row))),
            None => table.rows.push(row),
        }

        Ok(ExecResult {
            rows: Vec::new(),
            affected: 1,
            last_id,
        })
    }

    /// Shared path for UPDATE and DELETE: resolve the predicate, build the
    /// op, count the visible rows it touches, then buffer it or apply it.
    fn write_op(
        &self,
        table_name: &str,
        predicate: Option<&Predicate>,
        params: &[Value],
        build: impl FnOnce(&Table, ResolvedPredicate) -> Result<Op>,
    ) -> Result<ExecResult> {
        let mut tables = lock(&self.db.inner.tables);
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| no_such_table(table_name))?;
        let resolved = resolve_predicate(table_name, table, predicate, params)?;

        let mut tx = lock(&self.tx);
        let affected = visible_rows(table_name, table, (*tx).as_ref())
            .iter()
            .filter(|row| matches(&table.columns, row, &resolved))
            .count() as u64;

        let op = build(table, resolved)?;
        match (*tx).as_mut() {
            Some(buffer) => buffer.ops.push((table_name.to_string(), op)),
            None => {
                let columns = Arc::clone(&table.columns);
                apply_op(&columns, &mut table.rows, &op);
            }
        }

        Ok(done(affected))
    }

    fn select_rows(
        &self,
        table_name: &str,
        predicate: Option<&Predicate>,
        limit: Option<usize>,
        params: &[Value],
    ) -> Result<ExecResult> {
        let tables = lock(&self.db.inner.tables);
        let table = tables
            .get(table_name)
            .ok_or_else(|| no_such_table(table_name))?;
        let resolved = resolve_predicate(table_name, table, predicate, params)?;

        let tx = lock(&self.tx);
        let mut rows: Vec<Row> = visible_rows(table_name, table, (*tx).as_ref())
            .into_iter()
            .filter(|row| matches(&table.columns, row, &resolved))
            .collect();

        if let Some(limit) = limit {
            rows.truncate(limit);
        }

        let affected = rows.len() as u64;
        Ok(ExecResult {
            rows,
            affected,
            last_id: 0,
        })
    }
}

fn resolve_predicate(
    table_name: &str,
    table: &Table,
    predicate: Option<&Predicate>,
    params: &[Value],
) -> Result<ResolvedPredicate> {
    let Some(predicate) = predicate else {
        return Ok(None);
    };
    if table.columns.index_of(&predicate.column).is_none() {
        return Err(no_such_column(table_name, &predicate.column));
    }
    let value = params
        .get(predicate.param)
        .cloned()
        .ok_or_else(|| missing_param(predicate.param))?;
    Ok(Some((predicate.column.clone(), value)))
}

fn no_such_table(name: &str) -> Error {
    Error::query(QueryErrorKind::Database, format!("no such table: {name:?}"))
}

fn no_such_column(table: &str, column: &str) -> Error {
    Error::query(
        QueryErrorKind::Database,
        format!("no column {column:?} in table {table:?}"),
    )
}

fn no_such_column_err(column: &str) -> Error {
    Error::query(QueryErrorKind::Database, format!("no such column: {column:?}"))
}

fn missing_param(index: usize) -> Error {
    Error::query(
        QueryErrorKind::Database,
        format!("missing bind parameter ${}", index + 1),
    )
}

impl Connection for MemConnection {
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = self.run_outcome(cx, sql, params).map(|r| r.rows);
        async move { outcome }
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let outcome = self
            .run_outcome(cx, sql, params)
            .map(|r| r.rows.into_iter().next());
        async move { outcome }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = self.run_outcome(cx, sql, params).map(|r| r.affected);
        async move { outcome }
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = self.run_outcome(cx, sql, params).map(|r| r.last_id);
        async move { outcome }
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = match cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => Outcome::Ok(()),
        };
        async move { outcome }
    }

    fn close(self, _cx: &Cx) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

impl std::fmt::Debug for MemConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_tx = lock(&self.tx).is_some();
        f.debug_struct("MemConnection").field("in_tx", &in_tx).finish()
    }
}
