use once_cell::sync::Lazy;
use regex::Regex;

/// Best-effort PII scrubbing for SQL text and messages headed to logs.
///
/// Regex based, so literals built by concatenation or unusual quoting can
/// slip through. The audit table keeps the original statement; only log
/// lines go through here.
static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").unwrap());

// 13-19 digits, optionally grouped by spaces or hyphens
static CARD_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").unwrap());

// +1 555-123-4567, (555) 123-4567, 13812345678
static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[-. ]?)?(?:\(\d{3}\)|\d{3})[-. ]?\d{3,4}[-. ]?\d{4}").unwrap()
});

pub fn scrub(input: &str) -> String {
    let scrubbed = EMAIL_REGEX.replace_all(input, "[EMAIL]");
    let scrubbed = CARD_REGEX.replace_all(&scrubbed, "[CARD]");
    PHONE_REGEX.replace_all(&scrubbed, "[PHONE]").into_owned()
}
