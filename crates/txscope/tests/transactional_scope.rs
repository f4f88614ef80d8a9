//! End-to-end transaction scope behavior over the in-memory driver.

use asupersync::runtime::RuntimeBuilder;
use serde::{Deserialize, Serialize};
use txscope::prelude::*;
use txscope::{Error, QueryErrorKind, SessionErrorKind};
use txscope_memory::{MemConnection, MemDb};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: i64,
    body: String,
    stamps: Timestamps,
    deletion: SoftDelete,
}

impl Note {
    fn new(id: i64, body: impl Into<String>) -> Self {
        Self {
            id,
            body: body.into(),
            stamps: Timestamps::now(),
            deletion: SoftDelete::default(),
        }
    }
}

impl Model for Note {
    const TABLE_NAME: &'static str = "note";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "body",
        "created_at",
        "updated_at",
        "deleted_at",
        "is_deleted",
    ];
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn from_row(row: &Row) -> txscope::Result<Self> {
        Ok(Self {
            id: row.get_named_as("id")?,
            body: row.get_named_as("body")?,
            stamps: Timestamps {
                created_at: row.get_named_as("created_at")?,
                updated_at: row.get_named_as("updated_at")?,
            },
            deletion: SoftDelete {
                deleted_at: row.get_named_as("deleted_at")?,
                is_deleted: row.get_named_as("is_deleted")?,
            },
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.id),
            Value::Text(self.body.clone()),
            Value::Timestamp(self.stamps.created_at),
            self.stamps.updated_at.map(Value::Timestamp).unwrap_or(Value::Null),
            self.deletion.deleted_at.map(Value::Timestamp).unwrap_or(Value::Null),
            Value::Bool(self.deletion.is_deleted),
        ]
    }

    fn primary_key_value(&self) -> Value {
        Value::BigInt(self.id)
    }
}

fn note_db() -> MemDb {
    let db = MemDb::new();
    db.create_table("note", Note::COLUMNS);
    db
}

fn note_scope() -> SessionScope<MemConnection> {
    SessionScope::new(Pool::new(PoolConfig::new(2)))
}

#[test]
fn committed_writes_are_visible_to_independent_readers() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let db = note_db();
    let scope = note_scope();
    let mut ctx = RequestContext::new(RequestId::new("req-commit"));

    rt.block_on(async {
        let factory = || async { Outcome::Ok(db.connect()) };
        let note = Note::new(7, "shipping friday");
        let id = unwrap_outcome(
            scope
                .with_transaction(&cx, &mut ctx, factory, async |session| {
                    session.add(&cx, &note).await
                })
                .await,
        );
        assert_eq!(id, 7);

        // An independent connection, outside any scope, sees the commit.
        let reader = db.connect();
        let rows = unwrap_outcome(reader.query(&cx, "SELECT * FROM \"note\"", &[]).await);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named_as::<String>("body").expect("body"), "shipping friday");
    });

    assert!(!ctx.has_session());
}

#[test]
fn failed_work_leaves_no_trace_and_propagates_the_error() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let db = note_db();
    let scope = note_scope();
    let mut ctx = RequestContext::new(RequestId::new("req-rollback"));

    rt.block_on(async {
        let factory = || async { Outcome::Ok(db.connect()) };
        let outcome: Outcome<i64, Error> = scope
            .with_transaction(&cx, &mut ctx, factory, async |session| {
                let note = Note::new(1, "never lands");
                match session.add(&cx, &note).await {
                    Outcome::Ok(_) => {}
                    other => return other,
                }
                Outcome::Err(Error::query(QueryErrorKind::Database, "body failed validation"))
            })
            .await;

        match outcome {
            Outcome::Err(Error::Query(q)) => assert_eq!(q.message, "body failed validation"),
            other => panic!("expected the validation error, got {other:?}"),
        }

        let reader = db.connect();
        let rows = unwrap_outcome(reader.query(&cx, "SELECT * FROM \"note\"", &[]).await);
        assert!(rows.is_empty());
    });

    assert_eq!(db.committed_count("note"), 0);
    let stats = scope.pool().stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.acquires, stats.releases);
}

#[test]
fn current_session_outside_any_scope_is_a_misuse_error() {
    let ctx = RequestContext::new(RequestId::new("req-naked"));
    let err = ctx.current_session().expect_err("no scope active");
    assert_eq!(err.session_kind(), Some(SessionErrorKind::NoActiveSession));
}

#[test]
fn sequential_scopes_use_distinct_sessions_and_balance_the_pool() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let db = note_db();
    let scope = note_scope();

    let mut session_ids = Vec::new();
    rt.block_on(async {
        let factory = || async { Outcome::Ok(db.connect()) };
        for i in 0..3i64 {
            let mut ctx = RequestContext::new(RequestId::generate());
            let ids = &mut session_ids;
            unwrap_outcome(
                scope
                    .with_transaction(&cx, &mut ctx, factory, async |session| {
                        ids.push(session.id());
                        session.add(&cx, &Note::new(i + 1, format!("note {i}"))).await
                    })
                    .await,
            );
            assert!(!ctx.has_session());
        }
    });

    assert_eq!(session_ids.len(), 3);
    let distinct: std::collections::HashSet<_> = session_ids.iter().copied().collect();
    assert_eq!(distinct.len(), 3, "sessions must never repeat across requests");

    assert_eq!(db.committed_count("note"), 3);
    let stats = scope.pool().stats();
    assert_eq!(stats.acquires, stats.releases);
    assert_eq!(stats.in_use, 0);
    // Sequential scopes reuse one pooled connection.
    assert_eq!(stats.created, 1);
}

#[test]
fn soft_delete_flow_persists_through_update() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let db = note_db();
    let scope = note_scope();

    rt.block_on(async {
        let factory = || async { Outcome::Ok(db.connect()) };

        let mut ctx = RequestContext::new(RequestId::new("req-seed"));
        unwrap_outcome(
            scope
                .with_transaction(&cx, &mut ctx, factory, async |session| {
                    match session.add(&cx, &Note::new(1, "keep me")).await {
                        Outcome::Ok(_) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                    session.add(&cx, &Note::new(2, "retire me")).await
                })
                .await,
        );

        let mut ctx = RequestContext::new(RequestId::new("req-soft-delete"));
        unwrap_outcome(
            scope
                .with_transaction(&cx, &mut ctx, factory, async |session| {
                    let fetched: Option<Note> = match session.get(&cx, 2i64).await {
                        Outcome::Ok(n) => n,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    let Some(mut note) = fetched else {
                        return Outcome::Err(Error::query(QueryErrorKind::Database, "note 2 missing"));
                    };
                    note.deletion.soft_delete();
                    note.stamps.touch();
                    session.update(&cx, &note).await
                })
                .await,
        );

        let mut ctx = RequestContext::new(RequestId::new("req-audit"));
        let (active, retired): (Vec<Note>, Vec<Note>) = unwrap_outcome(
            scope
                .with_transaction(&cx, &mut ctx, factory, async |session| {
                    let active = match session.find_where(&cx, "is_deleted", false).await {
                        Outcome::Ok(rows) => rows,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    let retired = match session.find_where(&cx, "is_deleted", true).await {
                        Outcome::Ok(rows) => rows,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    Outcome::Ok((active, retired))
                })
                .await,
        );

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].body, "keep me");
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].body, "retire me");
        assert!(retired[0].deletion.deleted_at.is_some());
        assert!(retired[0].stamps.updated_at.is_some());
    });
}

#[test]
fn model_serializes_for_response_bodies() {
    let note = Note::new(9, "wire format");
    let json = serde_json::to_value(&note).expect("serialize");
    assert_eq!(json["id"], 9);
    assert_eq!(json["body"], "wire format");
    let back: Note = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back, note);
}
