//! Heuristic ECharts suggestions from a result table.
//!
//! Columns are profiled over a sample: mostly-numeric columns are metrics,
//! mostly date-like ones are time dimensions, the rest are categories.
//!
//! | shape                                   | chart        |
//! |-----------------------------------------|--------------|
//! | only numeric columns (two or more)      | scatter      |
//! | a date dimension                        | line         |
//! | category + small second category        | stacked bar  |
//! | category with <= 6 values, one metric   | pie          |
//! | anything else with a dimension + metric | bar          |
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

use crate::collaborators::ChartAdvisor;

const SAMPLE_ROWS: usize = 300;
const MAX_UNIQUES: usize = 200;
const PIE_MAX_SLICES: usize = 6;
const STACK_MAX_SERIES: usize = 8;
const STACK_MAX_CATEGORIES: usize = 30;
const MAX_METRICS: usize = 3;

static DATE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}[-/]\d{2}[-/]\d{2}").unwrap());

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicChartAdvisor;

impl ChartAdvisor for BasicChartAdvisor {
    fn suggest(&self, columns: &[String], rows: &[Vec<Value>]) -> Option<Value> {
        suggest_chart(columns, rows)
    }
}

#[derive(Debug, Clone)]
struct Profile {
    index: usize,
    non_null: usize,
    numeric_ratio: f64,
    date_ratio: f64,
    unique_count: usize,
}

fn is_date_like(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            DATE_PREFIX.is_match(s) || chrono::DateTime::parse_from_rfc3339(s).is_ok()
        }
        _ => false,
    }
}

fn profile(columns: &[String], rows: &[Vec<Value>]) -> Vec<Profile> {
    (0..columns.len())
        .map(|index| {
            let mut non_null = 0;
            let mut numeric = 0;
            let mut dates = 0;
            let mut uniques: HashSet<String> = HashSet::new();
            for value in rows.iter().filter_map(|r| r.get(index)) {
                if value.is_null() {
                    continue;
                }
                non_null += 1;
                if value.is_number() {
                    numeric += 1;
                } else if is_date_like(value) {
                    dates += 1;
                }
                if uniques.len() < MAX_UNIQUES {
                    uniques.insert(value.to_string());
                }
            }
            let ratio = |count: usize| {
                if non_null == 0 {
                    0.0
                } else {
                    count as f64 / non_null as f64
                }
            };
            Profile {
                index,
                non_null,
                numeric_ratio: ratio(numeric),
                date_ratio: ratio(dates),
                unique_count: uniques.len(),
            }
        })
        .collect()
}

/// Distinct values of a column in order of first appearance.
fn ordered_values(rows: &[Vec<Value>], index: usize) -> Vec<Value> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|r| r.get(index))
        .filter(|v| seen.insert(v.to_string()))
        .cloned()
        .collect()
}

fn label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cell(row: &[Value], index: usize) -> Value {
    row.get(index).cloned().unwrap_or(Value::Null)
}

pub fn suggest_chart(columns: &[String], rows: &[Vec<Value>]) -> Option<Value> {
    if columns.len() < 2 || rows.is_empty() {
        return None;
    }
    let sample = &rows[..rows.len().min(SAMPLE_ROWS)];
    let profiles = profile(columns, sample);

    let numeric: Vec<&Profile> = profiles.iter().filter(|p| p.numeric_ratio >= 0.8).collect();
    let dates: Vec<&Profile> = profiles.iter().filter(|p| p.date_ratio >= 0.6).collect();
    let mut categories: Vec<&Profile> = profiles
        .iter()
        .filter(|p| p.numeric_ratio < 0.6 && p.date_ratio < 0.6)
        .collect();

    if numeric.len() >= 2 && dates.is_empty() && categories.is_empty() {
        let (x, y) = (numeric[0].index, numeric[1].index);
        let data: Vec<Value> = sample
            .iter()
            .filter_map(|r| match (r.get(x), r.get(y)) {
                (Some(a), Some(b)) if a.is_number() && b.is_number() => Some(json!([a, b])),
                _ => None,
            })
            .collect();
        if data.is_empty() {
            return None;
        }
        return Some(json!({
            "title": {"text": format!("{} vs {}", columns[y], columns[x])},
            "tooltip": {"trigger": "item"},
            "xAxis": {"type": "value", "name": columns[x]},
            "yAxis": {"type": "value", "name": columns[y]},
            "series": [{"type": "scatter", "data": data}],
        }));
    }

    let mut metrics = numeric.clone();
    metrics.sort_by(|a, b| b.non_null.cmp(&a.non_null));
    if metrics.is_empty() {
        return None;
    }

    if let Some(dim) = dates.first() {
        let used = &metrics[..metrics.len().min(MAX_METRICS)];
        let series: Vec<Value> = used
            .iter()
            .map(|m| {
                json!({
                    "type": "line",
                    "name": columns[m.index],
                    "data": sample.iter().map(|r| cell(r, m.index)).collect::<Vec<_>>(),
                })
            })
            .collect();
        let names: Vec<&str> = used.iter().map(|m| columns[m.index].as_str()).collect();
        return Some(json!({
            "title": {"text": format!("{} over {}", names.join(", "), columns[dim.index])},
            "tooltip": {"trigger": "axis"},
            "xAxis": {"type": "category", "data": ordered_values(sample, dim.index)},
            "yAxis": {"type": "value"},
            "series": series,
        }));
    }

    categories.sort_by(|a, b| {
        a.unique_count
            .cmp(&b.unique_count)
            .then(b.non_null.cmp(&a.non_null))
    });
    let dim = *categories.first()?;
    let dim_name = &columns[dim.index];
    let dim_values = ordered_values(sample, dim.index);

    let second = categories
        .iter()
        .find(|c| c.index != dim.index && c.unique_count <= STACK_MAX_SERIES);
    if let Some(second) = second {
        if dim.unique_count <= STACK_MAX_CATEGORIES {
            let metric = metrics[0];
            let mut buckets: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
            for r in sample {
                let Some(v) = r.get(metric.index).and_then(Value::as_f64) else {
                    continue;
                };
                buckets
                    .entry(label(&cell(r, second.index)))
                    .or_default()
                    .insert(cell(r, dim.index).to_string(), v);
            }
            let series: Vec<Value> = buckets
                .iter()
                .map(|(name, bucket)| {
                    let data: Vec<f64> = dim_values
                        .iter()
                        .map(|d| bucket.get(&d.to_string()).copied().unwrap_or(0.0))
                        .collect();
                    json!({"type": "bar", "stack": dim_name, "name": name, "data": data})
                })
                .collect();
            return Some(json!({
                "title": {"text": format!("{} by {} & {}", columns[metric.index], dim_name, columns[second.index])},
                "tooltip": {"trigger": "axis"},
                "legend": {"type": "scroll"},
                "xAxis": {"type": "category", "data": dim_values},
                "yAxis": {"type": "value"},
                "series": series,
            }));
        }
    }

    if metrics.len() == 1 {
        let metric = metrics[0];
        let data: Vec<Value> = sample
            .iter()
            .filter_map(|r| r.get(metric.index))
            .filter(|v| v.is_number())
            .cloned()
            .collect();
        let title = format!("{} by {}", columns[metric.index], dim_name);
        if dim.unique_count <= PIE_MAX_SLICES {
            let slices: Vec<Value> = dim_values
                .iter()
                .enumerate()
                .map(|(i, v)| json!({"name": label(v), "value": data.get(i).cloned().unwrap_or(json!(0))}))
                .collect();
            return Some(json!({
                "title": {"text": title},
                "tooltip": {"trigger": "item"},
                "series": [{"type": "pie", "radius": ["35%", "65%"], "data": slices}],
            }));
        }
        return Some(json!({
            "title": {"text": title},
            "tooltip": {"trigger": "axis"},
            "xAxis": {"type": "category", "data": dim_values},
            "yAxis": {"type": "value"},
            "series": [{"type": "bar", "name": columns[metric.index], "data": data}],
        }));
    }

    let series: Vec<Value> = metrics[..metrics.len().min(MAX_METRICS)]
        .iter()
        .map(|m| {
            json!({
                "type": "bar",
                "name": columns[m.index],
                "data": sample.iter().map(|r| cell(r, m.index)).collect::<Vec<_>>(),
            })
        })
        .collect();
    Some(json!({
        "title": {"text": format!("{dim_name} comparison")},
        "tooltip": {"trigger": "axis"},
        "legend": {},
        "xAxis": {"type": "category", "data": dim_values},
        "yAxis": {"type": "value"},
        "series": series,
    }))
}
