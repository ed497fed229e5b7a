//! Deterministic fake driver and fixtures for exercising the pool,
//! routing, retry, and group-insert machinery without a live database.

mod fake_driver;

pub use fake_driver::{ExecRecord, FakeDriver, FakeStats};
