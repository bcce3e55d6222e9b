//! Database access for askql.
//!
//! - `sql_text`: the read-only gate and the table-name scanner.
//! - `gateway`: pooled, breaker-guarded execution and catalog reads.
//! - `sources`: driver backends and the schema drift monitor.
pub mod error;
pub mod gateway;
pub mod sources;
pub mod sql_text;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::GatewayError;
pub use gateway::{GatewaySettings, PoolRegistry, QueryGateway};
pub use sources::schema_drift::{DriftOutcome, SchemaDiff, SchemaDriftMonitor};
pub use sources::{BackendFactory, SqlBackend};
