//! Static advice about a statement and how it ran.
use once_cell::sync::Lazy;
use regex::Regex;

static SELECT_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bselect\s+\*").unwrap());
static WHERE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bwhere\b").unwrap());
static LIMIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blimit\b").unwrap());
static ORDER_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\border\s+by\b").unwrap());

pub struct SafetyInput<'a> {
    pub sql: &'a str,
    pub row_count: Option<usize>,
    pub elapsed_ms: Option<u64>,
    pub max_rows: usize,
    pub slow_threshold_ms: u64,
}

pub fn safety_tips(input: &SafetyInput<'_>) -> Vec<String> {
    let sql = input.sql;
    let has_limit = LIMIT.is_match(sql);
    let mut tips = Vec::new();

    if SELECT_STAR.is_match(sql) {
        tips.push("Avoid SELECT *; select only the columns you need.".to_string());
    }
    if !WHERE.is_match(sql) {
        tips.push("No WHERE clause found; add a filter to reduce the scanned range.".to_string());
    }
    if !has_limit {
        tips.push("No LIMIT found; consider limiting the number of returned rows.".to_string());
    }
    if input.row_count.is_some_and(|n| n >= input.max_rows) {
        tips.push(format!(
            "The result reached the row cap of {}; add a LIMIT or narrower filters.",
            input.max_rows
        ));
    }
    if input
        .elapsed_ms
        .is_some_and(|ms| ms >= input.slow_threshold_ms)
    {
        tips.push(
            "The query was slow; add filters, reduce dimensions or check the indexes.".to_string(),
        );
    }
    if ORDER_BY.is_match(sql) && !has_limit {
        tips.push("ORDER BY without LIMIT may cause an expensive sort.".to_string());
    }
    tips
}
