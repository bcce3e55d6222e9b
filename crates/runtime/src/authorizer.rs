//! Per-request table allowlisting.
//!
//! The allowed set is rebuilt for every request from the live catalog, the
//! caller's uploads and an optional saved scope. Every candidate statement
//! is checked against it before it may reach the gateway.
use std::collections::BTreeSet;

use askql_common::store::AccessStore;
use askql_connectors::sql_text::extract_table_names;
use askql_connectors::{GatewayError, QueryGateway};
use askql_error::{AskqlError, Classify, ErrorClass, ErrorCode, ErrorContext};
use thiserror::Error;
use tracing::{debug, warn};

/// Relations with this prefix are staging tables and never offered.
pub const TEMP_TABLE_PREFIX: &str = "tmp_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedTableSet {
    tables: BTreeSet<String>,
}

impl AllowedTableSet {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Sorted table names.
    pub fn names(&self) -> Vec<String> {
        self.tables.iter().cloned().collect()
    }

    /// Keep only the tables also present in `scope`.
    pub fn restrict_to(&mut self, scope: &[String]) {
        let scope: BTreeSet<&str> = scope.iter().map(String::as_str).collect();
        self.tables.retain(|t| scope.contains(t.as_str()));
    }

    /// Accept `sql` when every referenced table is allowed. A statement that
    /// references no table at all passes.
    pub fn authorize(&self, sql: &str) -> Result<(), AuthorizationError> {
        let referenced = extract_table_names(sql);
        let disallowed: BTreeSet<String> = referenced
            .iter()
            .filter(|t| !self.contains(t))
            .cloned()
            .collect();
        if disallowed.is_empty() {
            return Ok(());
        }
        Err(AuthorizationError {
            disallowed: disallowed.into_iter().collect(),
            referenced,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SQL references tables not allowed for this user: {}", .disallowed.join(", "))]
pub struct AuthorizationError {
    /// Sorted.
    pub disallowed: Vec<String>,
    pub referenced: Vec<String>,
}

impl Classify for AuthorizationError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Authorization
    }
}

impl From<AuthorizationError> for AskqlError {
    fn from(err: AuthorizationError) -> Self {
        AskqlError::new(ErrorCode::TableNotAllowed, err.to_string()).with_context(
            ErrorContext::Allowlist {
                disallowed_tables: err.disallowed,
                referenced_tables: err.referenced,
            },
        )
    }
}

/// Builds the [`AllowedTableSet`] for one caller and datasource.
pub struct AllowlistResolver<'a> {
    gateway: &'a QueryGateway,
    access: &'a dyn AccessStore,
}

impl<'a> AllowlistResolver<'a> {
    pub fn new(gateway: &'a QueryGateway, access: &'a dyn AccessStore) -> Self {
        Self { gateway, access }
    }

    /// `(catalog − tmp_*) ∪ uploads`, intersected with the scope's tables
    /// when `scope_id` names a scope owned by `user`.
    ///
    /// Catalog failures propagate; upload and scope reads are best-effort.
    pub async fn resolve(
        &self,
        user: &str,
        datasource_id: &str,
        scope_id: Option<i64>,
    ) -> Result<AllowedTableSet, GatewayError> {
        let catalog = self.gateway.list_tables(datasource_id).await?;
        let mut allowed = AllowedTableSet::new(
            catalog
                .into_iter()
                .map(|t| t.name)
                .filter(|name| !name.starts_with(TEMP_TABLE_PREFIX)),
        );

        match self.access.upload_tables(user, datasource_id).await {
            Ok(uploads) => allowed.tables.extend(uploads),
            Err(e) => warn!(user, datasource = %datasource_id, error = %e, "upload list unavailable"),
        }

        if let Some(scope_id) = scope_id {
            match self.access.table_scope(user, scope_id).await {
                Ok(Some(scope)) if scope.datasource_id == datasource_id => {
                    allowed.restrict_to(&scope.tables);
                }
                Ok(Some(_)) => {
                    debug!(user, scope_id, "scope belongs to another datasource; ignored");
                }
                Ok(None) => debug!(user, scope_id, "scope not found; ignored"),
                Err(e) => warn!(user, scope_id, error = %e, "scope lookup failed"),
            }
        }

        debug!(user, datasource = %datasource_id, tables = allowed.len(), "allowlist resolved");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_with_disallowed_names() {
        let allowed = AllowedTableSet::new(["A", "B", "C"]);
        let err = allowed.authorize("SELECT * FROM A JOIN D ON A.id = D.id").unwrap_err();
        assert_eq!(err.disallowed, vec!["D"]);
        assert_eq!(err.referenced, vec!["A", "D"]);
        assert_eq!(err.class(), ErrorClass::Authorization);
    }

    #[test]
    fn test_accepts_subset_and_tableless() {
        let allowed = AllowedTableSet::new(["orders", "customers"]);
        assert!(allowed
            .authorize("SELECT o.id FROM `orders` o JOIN \"customers\" c ON o.cid = c.id")
            .is_ok());
        assert!(allowed.authorize("SELECT 1").is_ok());
        assert!(allowed.authorize("SELECT * FROM shop.orders").is_ok());
    }

    #[test]
    fn test_disallowed_is_sorted() {
        let allowed = AllowedTableSet::new(["a"]);
        let err = allowed
            .authorize("SELECT * FROM zeta JOIN beta ON 1=1 JOIN a ON 1=1")
            .unwrap_err();
        assert_eq!(err.disallowed, vec!["beta", "zeta"]);
    }

    #[test]
    fn test_cte_name_counts_as_table() {
        let allowed = AllowedTableSet::new(["orders"]);
        let err = allowed
            .authorize("WITH recent AS (SELECT * FROM orders) SELECT * FROM recent")
            .unwrap_err();
        assert_eq!(err.disallowed, vec!["recent"]);
    }

    #[test]
    fn test_restrict_to_scope() {
        let mut allowed = AllowedTableSet::new(["a", "b", "c"]);
        allowed.restrict_to(&["b".to_string(), "z".to_string()]);
        assert_eq!(allowed.names(), vec!["b"]);
    }

    #[test]
    fn test_askql_error_carries_tables() {
        let err: AskqlError = AllowedTableSet::new(["a"])
            .authorize("SELECT * FROM secret")
            .unwrap_err()
            .into();
        assert_eq!(err.code, ErrorCode::TableNotAllowed);
        assert_eq!(err.class, ErrorClass::Authorization);
    }
}
