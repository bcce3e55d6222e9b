//! SQLite persistence for askql.
//!
//! [`SqliteStore`] implements every port in `askql_common::store` over a
//! single connection file. The schema is applied on open.
mod error;
mod sqlite;

pub use error::StoreError;
pub use sqlite::SqliteStore;
