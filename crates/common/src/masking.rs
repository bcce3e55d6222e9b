//! Column-name based value masking for result tables.
use serde_json::Value;

use crate::config::MaskingSettings;

#[derive(Debug, Clone)]
pub struct Masker {
    keywords: Vec<String>,
    keep_start: usize,
    keep_end: usize,
}

impl Masker {
    pub fn new(settings: &MaskingSettings) -> Self {
        Self {
            keywords: settings
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            keep_start: settings.keep_start,
            keep_end: settings.keep_end,
        }
    }

    /// Indices of columns whose lower-cased name contains a keyword.
    pub fn sensitive_columns(&self, columns: &[String]) -> Vec<usize> {
        columns
            .iter()
            .enumerate()
            .filter(|(_, name)| {
                let name = name.to_lowercase();
                self.keywords.iter().any(|k| name.contains(k.as_str()))
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Mask sensitive columns in place.
    pub fn mask_rows(&self, columns: &[String], rows: &mut [Vec<Value>]) {
        let indices = self.sensitive_columns(columns);
        if indices.is_empty() {
            return;
        }
        for row in rows.iter_mut() {
            for &idx in &indices {
                if let Some(cell) = row.get_mut(idx) {
                    *cell = mask_value(cell, self.keep_start, self.keep_end);
                }
            }
        }
    }
}

/// `ab****yz` style masking; short values become all `*`, NULL stays NULL.
pub fn mask_value(value: &Value, keep_start: usize, keep_end: usize) -> Value {
    let text = match value {
        Value::Null => return Value::Null,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len <= keep_start + keep_end {
        return Value::String("*".repeat(len));
    }

    let mut out = String::with_capacity(text.len());
    out.extend(&chars[..keep_start]);
    out.push_str(&"*".repeat(len - keep_start - keep_end));
    out.extend(&chars[len - keep_end..]);
    Value::String(out)
}
