//! PostgreSQL backend for sqlbridge, on the blocking `postgres` client.

mod driver;

pub use driver::{PostgresDriver, register};
