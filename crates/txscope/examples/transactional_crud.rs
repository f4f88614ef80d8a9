//! Walkthrough: two request flows over one scope — a commit and a rollback.
//!
//! Run with `cargo run --example transactional_crud`.

use asupersync::runtime::RuntimeBuilder;
use txscope::prelude::*;
use txscope::QueryErrorKind;
use txscope_memory::MemDb;

fn main() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    let config = DbConfig::from_url("postgres://app@localhost/appdb")
        .expect("parse database url")
        .pool_sizes(1, 4);
    config.validate().expect("valid config");

    let db = MemDb::new();
    db.create_table("example", &["id", "name"]);

    let scope = SessionScope::new(Pool::new(PoolConfig::from(&config)));

    rt.block_on(async {
        let factory = || async { Outcome::Ok(db.connect()) };

        // Request 1: the work succeeds, so the insert commits.
        let mut ctx = RequestContext::new(RequestId::new("req-1"));
        let outcome = scope
            .with_transaction(&cx, &mut ctx, factory, async |session| {
                session
                    .insert(
                        &cx,
                        "INSERT INTO \"example\" (\"name\") VALUES ($1)",
                        &[Value::Text("durable".into())],
                    )
                    .await
            })
            .await;
        match outcome {
            Outcome::Ok(id) => println!("request 1 committed row {id}"),
            other => println!("request 1 did not commit: {other:?}"),
        }

        // Request 2: the work fails after writing, so the insert rolls back.
        let mut ctx = RequestContext::new(RequestId::new("req-2"));
        let outcome: Outcome<i64, Error> = scope
            .with_transaction(&cx, &mut ctx, factory, async |session| {
                match session
                    .insert(
                        &cx,
                        "INSERT INTO \"example\" (\"name\") VALUES ($1)",
                        &[Value::Text("ephemeral".into())],
                    )
                    .await
                {
                    Outcome::Ok(_) => {}
                    other => return other,
                }
                Outcome::Err(Error::query(QueryErrorKind::Database, "name failed validation"))
            })
            .await;
        match outcome {
            Outcome::Err(e) => println!("request 2 rolled back: {e}"),
            other => println!("request 2 unexpectedly finished: {other:?}"),
        }

        println!(
            "committed rows: {} (scope stats: {:?})",
            db.committed_count("example"),
            scope.stats()
        );
    });
}
