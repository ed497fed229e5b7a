use sqlbridge_core::{DataType, ErrorKind, Pool, PoolFlags, Stmt, Value};
use sqlbridge_test_support::FakeDriver;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[test]
fn selects_route_to_readonly_pool_unless_master_only() {
    init_logging();
    let fake = FakeDriver::new("fake-routing");
    fake.register();
    let pool = Pool::builder("fake-routing", "host=primary")
        .readonly_pool("host=replica", 2)
        .max_conns(2)
        .start()
        .expect("pool start");

    let mut select = Stmt::new();
    select.prepare("SELECT 1").expect("prepare");
    select.execute(&pool).expect("select execute");

    let mut insert = Stmt::new();
    insert.prepare("INSERT INTO t VALUES (?)").expect("prepare");
    insert.bind_int32(1).expect("bind");
    insert.execute(&pool).expect("insert execute");

    let mut pinned = Stmt::new();
    pinned.prepare("SELECT 1").expect("prepare");
    pinned.set_master_only().expect("master only");
    pinned.execute(&pool).expect("pinned select execute");

    let stats = fake.stats();
    assert_eq!(stats.executes.len(), 3);
    assert!(stats.executes[0].readonly, "plain SELECT should hit replica");
    assert!(!stats.executes[1].readonly, "INSERT must hit primary");
    assert!(
        !stats.executes[2].readonly,
        "master-only SELECT must hit primary"
    );
}

#[test]
fn leading_comments_do_not_hide_the_select() {
    let fake = FakeDriver::new("fake-routing-comments");
    fake.register();
    let pool = Pool::builder("fake-routing-comments", "host=primary")
        .readonly_pool("host=replica", 1)
        .max_conns(1)
        .start()
        .expect("pool start");

    let mut select = Stmt::new();
    select
        .prepare("/* report */ -- nightly\n SELECT count(*) FROM t")
        .expect("prepare");
    select.execute(&pool).expect("execute");

    assert!(fake.stats().executes[0].readonly);
}

// ---------------------------------------------------------------------------
// Retry harness
// ---------------------------------------------------------------------------

#[test]
fn standalone_statements_retry_through_deadlocks() {
    let fake = FakeDriver::new("fake-retry")
        .fail_executes("UPDATE t SET a = 1", ErrorKind::QueryDeadlock, 2);
    fake.register();
    let pool = Pool::builder("fake-retry", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    let mut stmt = Stmt::new();
    stmt.prepare("UPDATE t SET a = 1").expect("prepare");
    let kind = stmt.execute(&pool).expect("execute should retry to success");
    assert_eq!(kind, ErrorKind::Success);

    // Two scripted deadlocks plus the final success.
    assert_eq!(fake.stats().executes.len(), 1);
    assert_eq!(fake.stats().rollbacks, 2, "deadlocked conns roll back on release");
}

#[test]
fn no_autoretry_flag_surfaces_the_deadlock() {
    let fake = FakeDriver::new("fake-noretry")
        .fail_executes("UPDATE t SET a = 1", ErrorKind::QueryDeadlock, 1);
    fake.register();
    let pool = Pool::builder("fake-noretry", "host=h")
        .max_conns(1)
        .flags(PoolFlags::NO_AUTORETRY_QUERY)
        .start()
        .expect("pool start");

    let mut stmt = Stmt::new();
    stmt.prepare("UPDATE t SET a = 1").expect("prepare");
    let err = stmt.execute(&pool).expect_err("deadlock must surface");
    assert_eq!(err.kind(), ErrorKind::QueryDeadlock);
    assert_eq!(stmt.error(), ErrorKind::QueryDeadlock);
    assert!(!stmt.error_string().is_empty());
}

#[test]
fn fatal_errors_never_retry() {
    let fake = FakeDriver::new("fake-fatal")
        .fail_executes("INSERT INTO t VALUES (?)", ErrorKind::QueryConstraint, 1);
    fake.register();
    let pool = Pool::builder("fake-fatal", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    let mut stmt = Stmt::new();
    stmt.prepare("INSERT INTO t VALUES (?)").expect("prepare");
    stmt.bind_int32(7).expect("bind");
    let err = stmt.execute(&pool).expect_err("constraint must surface");
    assert_eq!(err.kind(), ErrorKind::QueryConstraint);
    assert_eq!(fake.stats().executes.len(), 0);
}

// ---------------------------------------------------------------------------
// Host scheduling
// ---------------------------------------------------------------------------

#[test]
fn failover_skips_a_failed_host() {
    let fake = FakeDriver::new("fake-failover").fail_connects(0, 1);
    fake.register();
    let pool = Pool::builder("fake-failover", "host=a,b")
        .max_conns(1)
        .start()
        .expect("pool should start on the second host");

    let mut stmt = Stmt::new();
    stmt.prepare("UPDATE t SET a = 2").expect("prepare");
    stmt.execute(&pool).expect("execute");

    let stats = fake.stats();
    assert_eq!(stats.executes[0].host_idx, 1);
}

#[test]
fn load_balancing_spreads_connections_across_hosts() {
    let fake = FakeDriver::new("fake-lb");
    fake.register();
    let pool = Pool::builder("fake-lb", "host=a,b")
        .max_conns(2)
        .flags(PoolFlags::PRESPAWN_ALL | PoolFlags::LOAD_BALANCE)
        .start()
        .expect("pool start");

    assert_eq!(pool.active_conns(false), 2);
    assert_eq!(fake.stats().connects, 2);

    // Both hosts should have been used for the prespawned pair.
    let mut stmt = Stmt::new();
    stmt.prepare("UPDATE t SET a = 3").expect("prepare");
    stmt.execute(&pool).expect("execute");
    let hosts: Vec<usize> = fake.stats().executes.iter().map(|e| e.host_idx).collect();
    assert!(hosts[0] == 0 || hosts[0] == 1);
}

#[test]
fn prespawn_all_fills_every_slot() {
    let fake = FakeDriver::new("fake-prespawn");
    fake.register();
    let pool = Pool::builder("fake-prespawn", "host=h")
        .max_conns(3)
        .flags(PoolFlags::PRESPAWN_ALL)
        .start()
        .expect("pool start");

    assert_eq!(pool.active_conns(false), 3);
    // Run-once fires per connection, the first-in-pool flavor exactly once.
    assert_eq!(fake.stats().runonce_calls, 3);
    assert_eq!(fake.stats().runonce_firsts, 1);
}

#[test]
fn on_demand_pool_starts_with_one_connection() {
    let fake = FakeDriver::new("fake-ondemand");
    fake.register();
    let pool = Pool::builder("fake-ondemand", "host=h")
        .max_conns(5)
        .start()
        .expect("pool start");
    assert_eq!(pool.active_conns(false), 1);
}

// ---------------------------------------------------------------------------
// Lifecycle timers and destroy
// ---------------------------------------------------------------------------

#[test]
fn aged_connections_are_retired_on_release() {
    let fake = FakeDriver::new("fake-retire");
    fake.register();
    let pool = Pool::builder("fake-retire", "host=h")
        .max_conns(1)
        .timeouts(1, 0, 0)
        .start()
        .expect("pool start");

    std::thread::sleep(std::time::Duration::from_millis(1100));

    // The release after this execute should retire the aged connection.
    let mut stmt = Stmt::new();
    stmt.prepare("UPDATE t SET a = 4").expect("prepare");
    stmt.execute(&pool).expect("execute");
    assert_eq!(fake.stats().disconnects, 1);

    // And the next acquire establishes a fresh one.
    let mut stmt = Stmt::new();
    stmt.prepare("UPDATE t SET a = 5").expect("prepare");
    stmt.execute(&pool).expect("execute");
    assert_eq!(fake.stats().connects, 2);
}

#[test]
fn destroy_refuses_while_connections_are_out() {
    let fake = FakeDriver::new("fake-destroy");
    fake.register();
    let pool = Pool::builder("fake-destroy", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    let trans = pool
        .begin(sqlbridge_core::Isolation::ReadCommitted)
        .expect("begin");
    let err = pool.destroy().expect_err("destroy must refuse");
    assert_eq!(err.kind(), ErrorKind::InUse);

    trans.rollback().expect("rollback");
    pool.destroy().expect("destroy after release");

    let mut stmt = Stmt::new();
    stmt.prepare("SELECT 1").expect("prepare");
    let err = stmt.execute(&pool).expect_err("pool is gone");
    assert_eq!(err.kind(), ErrorKind::InvalidUse);
}

// ---------------------------------------------------------------------------
// Chunked fetch
// ---------------------------------------------------------------------------

#[test]
fn chunked_fetch_row_counts_sum_to_total() {
    let rows: Vec<Vec<Value>> = (0..7).map(|n| vec![Value::Int64(n)]).collect();
    let fake = FakeDriver::new("fake-chunks").with_query_result(
        "SELECT n FROM seq",
        &[("n", DataType::Int64)],
        rows,
    );
    fake.register();
    let pool = Pool::builder("fake-chunks", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    let mut stmt = Stmt::new();
    stmt.prepare("SELECT n FROM seq").expect("prepare");
    stmt.set_max_fetch_rows(3).expect("fetch size");
    let kind = stmt.execute(&pool).expect("execute");
    assert_eq!(kind, ErrorKind::SuccessRow);

    let mut seen = stmt.result().num_rows();
    assert_eq!(seen, 3);
    while stmt.has_remaining_rows() {
        stmt.fetch().expect("fetch");
        seen += stmt.result().num_rows();
    }
    assert_eq!(seen, 7);
    assert_eq!(stmt.result().total_rows(), 7);
}

#[test]
fn unchunked_execute_buffers_everything() {
    let rows: Vec<Vec<Value>> = (0..5).map(|n| vec![Value::Int64(n)]).collect();
    let fake = FakeDriver::new("fake-nochunks").with_query_result(
        "SELECT n FROM seq",
        &[("n", DataType::Int64)],
        rows,
    );
    fake.register();
    let pool = Pool::builder("fake-nochunks", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    let mut stmt = Stmt::new();
    stmt.prepare("SELECT n FROM seq").expect("prepare");
    let kind = stmt.execute(&pool).expect("execute");
    assert_eq!(kind, ErrorKind::SuccessRow);
    assert!(!stmt.has_remaining_rows());
    assert_eq!(stmt.result().num_rows(), 5);
    assert_eq!(stmt.result().int64(4, 0).expect("cell"), Some(4));
}
