//! MySQL/MariaDB backend for sqlbridge, on the blocking `mysql` client.

mod driver;

pub use driver::{MysqlDriver, register};
