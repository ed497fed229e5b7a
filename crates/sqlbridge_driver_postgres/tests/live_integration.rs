//! Exercises a real PostgreSQL server. Run with a reachable server and:
//!
//! ```sh
//! SQLBRIDGE_PG_HOST=127.0.0.1 SQLBRIDGE_PG_DB=postgres \
//! SQLBRIDGE_PG_USER=postgres SQLBRIDGE_PG_PASS=postgres \
//! cargo test -p sqlbridge_driver_postgres -- --ignored
//! ```

use sqlbridge_core::{ErrorKind, Isolation, Pool, Stmt, UpdlockType, process};

fn live_pool() -> Pool {
    sqlbridge_driver_postgres::register().expect("driver registration");

    let host = std::env::var("SQLBRIDGE_PG_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let db = std::env::var("SQLBRIDGE_PG_DB").unwrap_or_else(|_| "postgres".to_string());
    let user = std::env::var("SQLBRIDGE_PG_USER").unwrap_or_else(|_| "postgres".to_string());
    let pass = std::env::var("SQLBRIDGE_PG_PASS").unwrap_or_default();

    Pool::builder("postgresql", &format!("host={host};db={db}"))
        .credentials(&user, &pass)
        .max_conns(2)
        .start()
        .expect("pool start")
}

fn exec(pool: &Pool, query: &str) {
    let mut stmt = Stmt::new();
    stmt.prepare(query).expect("prepare");
    stmt.execute(pool).expect("execute");
}

#[test]
#[ignore = "requires a PostgreSQL server"]
fn postgres_round_trip_and_placeholder_rewrite() {
    let pool = live_pool();
    assert!(pool.server_version().starts_with("PostgreSQL"));

    exec(&pool, "DROP TABLE IF EXISTS sqlbridge_rt");
    exec(
        &pool,
        "CREATE TABLE sqlbridge_rt (id BIGINT PRIMARY KEY, flag BOOLEAN, note TEXT, blob BYTEA)",
    );

    let mut insert = Stmt::new();
    insert
        .prepare("INSERT INTO sqlbridge_rt VALUES (?, ?, ?, ?)")
        .expect("prepare");
    insert.bind_int64(9_000_000_001).expect("id");
    insert.bind_bool(true).expect("flag");
    insert.bind_text("bonjour").expect("note");
    insert.bind_binary(vec![1, 2, 3]).expect("blob");
    insert.execute(&pool).expect("insert");

    let mut select = Stmt::new();
    select
        .prepare("SELECT flag, note, blob FROM sqlbridge_rt WHERE id = ?")
        .expect("prepare");
    select.bind_int64(9_000_000_001).expect("bind");
    select.execute(&pool).expect("select");
    assert_eq!(select.result().boolean(0, 0).expect("flag"), Some(true));
    assert_eq!(
        select.result().text_byname(0, "note").expect("note").as_deref(),
        Some("bonjour")
    );
    assert_eq!(
        select.result().binary(0, 2).expect("blob"),
        Some(&[1u8, 2, 3][..])
    );

    exec(&pool, "DROP TABLE sqlbridge_rt");
}

#[test]
#[ignore = "requires a PostgreSQL server"]
fn postgres_multirow_insert_and_conflict_shortfall() {
    let pool = live_pool();

    exec(&pool, "DROP TABLE IF EXISTS sqlbridge_mr");
    exec(
        &pool,
        "CREATE TABLE sqlbridge_mr (id INTEGER PRIMARY KEY, name TEXT)",
    );

    let mut insert = Stmt::new();
    insert
        .prepare("INSERT INTO sqlbridge_mr VALUES (?, ?)")
        .expect("prepare");
    for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
        if id > 1 {
            insert.new_row();
        }
        insert.bind_int32(id).expect("id");
        insert.bind_text(name).expect("name");
    }
    insert.execute(&pool).expect("insert");

    let mut count = Stmt::new();
    count
        .prepare("SELECT COUNT(*) FROM sqlbridge_mr")
        .expect("prepare");
    count.execute(&pool).expect("select");
    assert_eq!(count.result().int64(0, 0).expect("count"), Some(3));

    // The on-conflict rewrite hides the duplicate; the affected-row
    // shortfall resurfaces it as a constraint error.
    let mut dup = Stmt::new();
    dup.prepare("INSERT INTO sqlbridge_mr VALUES (?, ?)").expect("prepare");
    dup.bind_int32(2).expect("id");
    dup.bind_text("dup").expect("name");
    let err = dup.execute(&pool).expect_err("duplicate key");
    assert_eq!(err.kind(), ErrorKind::QueryConstraint);

    exec(&pool, "DROP TABLE sqlbridge_mr");
}

#[test]
#[ignore = "requires a PostgreSQL server"]
fn postgres_cursor_fetch_chunks() {
    let pool = live_pool();

    exec(&pool, "DROP TABLE IF EXISTS sqlbridge_seq");
    exec(&pool, "CREATE TABLE sqlbridge_seq (n INTEGER)");

    let mut insert = Stmt::new();
    insert
        .prepare("INSERT INTO sqlbridge_seq VALUES (?)")
        .expect("prepare");
    for n in 0..25i32 {
        if n > 0 {
            insert.new_row();
        }
        insert.bind_int32(n).expect("bind");
    }
    insert.execute(&pool).expect("insert");

    let mut select = Stmt::new();
    select
        .prepare("SELECT n FROM sqlbridge_seq ORDER BY n")
        .expect("prepare");
    select.set_max_fetch_rows(10).expect("fetch size");
    select.execute(&pool).expect("select");

    let mut total = select.result().num_rows();
    while select.has_remaining_rows() {
        select.fetch().expect("fetch");
        total += select.result().num_rows();
    }
    assert_eq!(total, 25);
    assert_eq!(select.result().total_rows(), 25);

    exec(&pool, "DROP TABLE sqlbridge_seq");
}

#[test]
#[ignore = "requires a PostgreSQL server"]
fn postgres_transaction_with_row_lock() {
    let pool = live_pool();

    exec(&pool, "DROP TABLE IF EXISTS sqlbridge_acct");
    exec(
        &pool,
        "CREATE TABLE sqlbridge_acct (id INTEGER PRIMARY KEY, balance BIGINT)",
    );
    let mut seed = Stmt::new();
    seed.prepare("INSERT INTO sqlbridge_acct VALUES (?, ?)").expect("prepare");
    seed.bind_int32(1).expect("id");
    seed.bind_int64(100).expect("balance");
    seed.execute(&pool).expect("seed");

    let kind = process(&pool, Isolation::ReadCommitted, |trans| {
        let mut query = String::from("SELECT balance FROM sqlbridge_acct");
        pool.append_updlock(&mut query, UpdlockType::Table, None);
        query.push_str(" WHERE id = ?");
        pool.append_updlock(&mut query, UpdlockType::QueryEnd, Some("sqlbridge_acct"));

        let mut select = Stmt::new();
        let _ = select.prepare_buf(query);
        let _ = select.bind_int32(1);
        if let Err(err) = trans.execute(&mut select) {
            return err.kind();
        }
        let balance = select.result().int64_direct(0, 0);

        let mut update = Stmt::new();
        let _ = update.prepare("UPDATE sqlbridge_acct SET balance = ? WHERE id = ?");
        let _ = update.bind_int64(balance + 50);
        let _ = update.bind_int32(1);
        match trans.execute(&mut update) {
            Ok(_) => ErrorKind::UserSuccess,
            Err(err) => err.kind(),
        }
    })
    .expect("process");
    assert_eq!(kind, ErrorKind::UserSuccess);

    let mut check = Stmt::new();
    check
        .prepare("SELECT balance FROM sqlbridge_acct WHERE id = ?")
        .expect("prepare");
    check.bind_int32(1).expect("bind");
    check.execute(&pool).expect("select");
    assert_eq!(check.result().int64(0, 0).expect("balance"), Some(150));

    exec(&pool, "DROP TABLE sqlbridge_acct");
}
