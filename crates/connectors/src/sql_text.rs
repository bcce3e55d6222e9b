//! Pure functions over SQL text: the read-only gate and table-name extraction.
//!
//! Neither is a parser. [`extract_table_names`] is a token scanner used only
//! as a defense-in-depth allowlist check; it can over-match a CTE name
//! (`WITH recent AS (...) SELECT * FROM recent` reports `recent`) and does
//! not understand comments or multi-statement input.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::GatewayError;

static READ_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(SELECT|WITH)\b").unwrap());

static WRITE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|TRUNCATE|ALTER|CREATE|REPLACE|GRANT|REVOKE)\b",
    )
    .unwrap()
});

// A reference must start with a quote or a word character, so `FROM (SELECT ...)`
// never matches and subqueries are skipped here.
static TABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:from|join)\s+([`"\[]?\w+[`"\]]?(?:\.[`"\[]?\w+[`"\]]?)?)"#).unwrap()
});

static IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Accept only statements that start with SELECT or WITH and mention no
/// write or DDL keyword anywhere.
pub fn validate_readonly(sql: &str) -> Result<(), GatewayError> {
    if !READ_PREFIX.is_match(sql) {
        return Err(GatewayError::Validation(
            "Only SELECT/WITH queries are allowed.".to_string(),
        ));
    }
    if let Some(m) = WRITE_KEYWORD.find(sql) {
        return Err(GatewayError::Validation(format!(
            "Write/DDL statements are not allowed (found {}).",
            m.as_str().to_uppercase()
        )));
    }
    Ok(())
}

/// Table names following FROM/JOIN, unquoted, schema qualifier dropped,
/// deduplicated in order of first appearance. Subqueries are skipped.
pub fn extract_table_names(sql: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in TABLE_REF.captures_iter(sql) {
        let Some(reference) = caps.get(1) else {
            continue;
        };
        let Some(last) = reference.as_str().rsplit('.').next() else {
            continue;
        };
        let name = last.trim_matches(|c| matches!(c, '`' | '"' | '[' | ']'));
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

pub fn is_valid_identifier(name: &str) -> bool {
    IDENT.is_match(name)
}

/// Backtick-quote a validated identifier.
pub fn quote_identifier(name: &str) -> Result<String, GatewayError> {
    if !is_valid_identifier(name) {
        return Err(GatewayError::Validation(format!(
            "Invalid table name: {name:?}"
        )));
    }
    Ok(format!("`{name}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_writes() {
        assert!(validate_readonly("DELETE FROM x").is_err());
        assert!(validate_readonly("update t set a=1").is_err());
        assert!(validate_readonly("SELECT 1; DROP TABLE users").is_err());
        assert!(validate_readonly("SHOW TABLES").is_err());
        assert!(validate_readonly("").is_err());
    }

    #[test]
    fn test_accepts_reads() {
        assert!(validate_readonly("  with c as (select 1) select * from c").is_ok());
        assert!(validate_readonly("\n\tSELECT id FROM orders").is_ok());
    }

    #[test]
    fn test_keyword_match_is_word_bounded() {
        assert!(validate_readonly("SELECT created_at, updated_by FROM orders").is_ok());
        // A bare keyword inside a literal still counts.
        assert!(validate_readonly("SELECT 'delete' AS action").is_err());
    }

    #[test]
    fn test_extract_quoted_and_joined() {
        let names =
            extract_table_names(r#"SELECT a FROM `orders` o JOIN "customers" c ON o.cid = c.id"#);
        assert_eq!(names, vec!["orders".to_string(), "customers".to_string()]);
    }

    #[test]
    fn test_extract_skips_subquery() {
        assert!(extract_table_names("SELECT * FROM (SELECT 1) t").is_empty());
        assert_eq!(
            extract_table_names("SELECT * FROM (SELECT id FROM users) t JOIN orders o ON 1=1"),
            vec!["users".to_string(), "orders".to_string()]
        );
    }

    #[test]
    fn test_extract_qualified_and_bracketed() {
        assert_eq!(
            extract_table_names("select * from sales.`orders` join [dbo].[items] on 1=1"),
            vec!["orders".to_string(), "items".to_string()]
        );
    }

    #[test]
    fn test_extract_deduplicates() {
        assert_eq!(
            extract_table_names("SELECT * FROM t JOIN t ON 1=1"),
            vec!["t".to_string()]
        );
    }

    #[test]
    fn test_cte_name_is_reported() {
        let names = extract_table_names("WITH recent AS (SELECT * FROM orders) SELECT * FROM recent");
        assert_eq!(names, vec!["orders".to_string(), "recent".to_string()]);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("orders_2024").unwrap(), "`orders_2024`");
        assert!(quote_identifier("orders`; DROP").is_err());
    }
}
