//! Driver-agnostic SQL access core: connection pooling with primary /
//! read-only routing, prepared statement execution with multi-row binding
//! and chunked fetching, scoped transactions with deadlock retry, and a
//! coalescing group-insert path. Backends plug in behind the
//! [`Driver`] trait; see the `sqlbridge_driver_*` crates.

mod conn;
mod connstr;
mod dialect;
mod driver;
mod error;
mod group_insert;
mod idgen;
mod pool;
mod queryformat;
mod result;
mod stmt;
mod table;
mod trace;
mod trans;
mod value;

pub use conn::ConnState;
pub use connstr::{ConnStr, ConnStrParam, ConnStrType, HostPort, parse_host_ports, validate_conn_str};
pub use dialect::{
    BitOp, BitOpCaps, UpdlockCaps, UpdlockType, append_bitop, append_updlock, rewrite_index_name,
};
pub use driver::{
    Driver, DriverConn, DriverPool, DriverPoolRequest, DriverRegistry, ExecuteResult, registry,
};
pub use error::{ErrorKind, SqlError};
pub use group_insert::GroupStmt;
pub use idgen::{gen_timerand_id, rollback_delay_ms};
pub use pool::{ConnGuard, Pool, PoolBuilder, PoolFlags};
pub use queryformat::{QueryFormatFlags, count_placeholders, first_keyword, format_query};
pub use result::{ResultBuffer, ResultCol};
pub use stmt::Stmt;
pub use table::TableBuilder;
pub use trace::{TraceEvent, TraceEventKind, TraceFn};
pub use trans::{Isolation, Trans, process};
pub use value::{DataType, Value};
