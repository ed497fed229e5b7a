//! SQLite backend for sqlbridge, on rusqlite's bundled SQLite.

mod driver;

pub use driver::{SqliteDriver, register};
