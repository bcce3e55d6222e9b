//! SQL database backends.
//!
//! MySQL is the only dialect the gateway speaks today; catalog reads go
//! through `INFORMATION_SCHEMA` of the connected database.
pub mod mysql;

pub use mysql::{MySqlBackend, MySqlBackendFactory, MySqlPoolSettings};
