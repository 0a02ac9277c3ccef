//! Preprocessing Engine
//!
//! Applies classifier output and quality analysis to a dataset, in a fixed
//! order where every step sees the previous step's output:
//!
//! 1. drop contact-data (PII) columns
//! 2. strip currency columns down to digits, `.` and `-`
//! 3. recompute quality and drop low-value columns
//! 4. drop rows equal to an earlier one after trimming, keeping the first
//! 5. trim every cell and coerce it to a number or an ISO-8601 timestamp
//!
//! Running it again on its own output is a no-op. No single cell can fail
//! the run: a value that doesn't convert stays a trimmed string.

use crate::classifier::CurrencyColumn;
use crate::dataset::{row_key, Dataset, Row};
use crate::quality::{DataQualitySummary, QualityAnalyzer};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::HashSet;
use tracing::{debug, info};

lazy_static! {
    static ref NON_NUMERIC: Regex = Regex::new(r"[^0-9.\-]+").unwrap();
    static ref NUMERIC_TEXT: Regex = Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap();
}

const DATE_FORMATS: [&str; 6] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d %b %Y", "%b %d, %Y", "%B %d, %Y"];
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

/// Which columns the classifier flagged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessOptions {
    #[serde(default)]
    pub email_columns: Vec<String>,
    #[serde(default)]
    pub currency_columns: Vec<CurrencyColumn>,
}

/// What a preprocessing run actually changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessReport {
    pub removed_pii_columns: Vec<String>,
    pub cleaned_currency_columns: Vec<String>,
    pub removed_low_value_columns: Vec<String>,
    pub duplicate_rows_removed: usize,
    pub numeric_cells: usize,
    pub date_cells: usize,
    /// Missing-value share above which a column was dropped.
    pub low_value_threshold: f64,
}

impl PreprocessReport {
    /// Human-readable step list, suitable for `preprocessingSteps`.
    pub fn steps(&self) -> Vec<String> {
        let mut steps = Vec::new();
        if !self.removed_pii_columns.is_empty() {
            steps.push(format!("Removed personal data columns: {}", self.removed_pii_columns.join(", ")));
        }
        if !self.cleaned_currency_columns.is_empty() {
            steps.push(format!(
                "Stripped currency symbols from: {}",
                self.cleaned_currency_columns.join(", ")
            ));
        }
        if !self.removed_low_value_columns.is_empty() {
            let pct = (self.low_value_threshold * 1000.0).round() / 10.0;
            steps.push(format!(
                "Removed low-value columns (>{}% missing): {}",
                pct,
                self.removed_low_value_columns.join(", ")
            ));
        }
        if self.duplicate_rows_removed > 0 {
            steps.push(format!("{} duplicate rows removed", self.duplicate_rows_removed));
        }
        steps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessOutcome {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub report: PreprocessReport,
    pub summary: DataQualitySummary,
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    analyzer: QualityAnalyzer,
}

impl Preprocessor {
    pub fn new(analyzer: QualityAnalyzer) -> Self {
        Self { analyzer }
    }

    pub fn run(&self, dataset: Dataset, options: &PreprocessOptions) -> PreprocessOutcome {
        let mut dataset = dataset;
        let mut report = PreprocessReport {
            low_value_threshold: self.analyzer.threshold(),
            ..PreprocessReport::default()
        };

        report.removed_pii_columns = drop_columns(&mut dataset, &options.email_columns);

        report.cleaned_currency_columns = strip_currency(&mut dataset, &options.currency_columns);

        // Low-value detection runs after PII removal, so a dropped PII column
        // can't be reported twice.
        let quality = self.analyzer.analyze(&dataset.headers, &dataset.rows);
        report.removed_low_value_columns = drop_columns(&mut dataset, &quality.low_value_columns);

        report.duplicate_rows_removed = dedupe_rows(&mut dataset);

        let (numeric_cells, date_cells) = standardize_types(&mut dataset);
        report.numeric_cells = numeric_cells;
        report.date_cells = date_cells;

        info!(
            "Preprocessed dataset: {} columns, {} rows ({} pii dropped, {} low-value dropped, {} duplicates)",
            dataset.headers.len(),
            dataset.rows.len(),
            report.removed_pii_columns.len(),
            report.removed_low_value_columns.len(),
            report.duplicate_rows_removed
        );

        let summary = self.analyzer.analyze(&dataset.headers, &dataset.rows);
        PreprocessOutcome { dataset, report, summary }
    }
}

/// Remove the named columns that are present; returns the ones removed.
fn drop_columns(dataset: &mut Dataset, names: &[String]) -> Vec<String> {
    let targets: HashSet<&String> = names.iter().collect();
    let removed: Vec<String> = dataset
        .headers
        .iter()
        .filter(|h| targets.contains(h))
        .cloned()
        .collect();
    if removed.is_empty() {
        return removed;
    }
    let kept: Vec<String> = dataset
        .headers
        .iter()
        .filter(|h| !targets.contains(h))
        .cloned()
        .collect();
    debug!("Dropping columns {:?}", removed);
    dataset.project(kept);
    removed
}

fn strip_currency(dataset: &mut Dataset, columns: &[CurrencyColumn]) -> Vec<String> {
    let present: Vec<String> = columns
        .iter()
        .map(|c| c.name.clone())
        .filter(|name| dataset.headers.contains(name))
        .collect();

    for row in dataset.rows.iter_mut() {
        for name in &present {
            if let Some(cell) = row.get_mut(name) {
                let text = match &*cell {
                    Value::Null => continue,
                    Value::String(s) if s.is_empty() => continue,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                *cell = Value::String(NON_NUMERIC.replace_all(&text, "").to_string());
            }
        }
    }
    present
}

/// Rows count as duplicates when they match after type standardization, so
/// `" A "` and `"A"` collapse here rather than surviving into the output.
fn dedupe_rows(dataset: &mut Dataset) -> usize {
    let before = dataset.rows.len();
    let mut seen: HashSet<String> = HashSet::new();
    dataset.rows.retain(|row| {
        let normalized: Row = row.iter().map(|(k, v)| (k.clone(), standardize_cell(v))).collect();
        seen.insert(row_key(&normalized))
    });
    before - dataset.rows.len()
}

fn standardize_types(dataset: &mut Dataset) -> (usize, usize) {
    let mut numeric = 0;
    let mut dates = 0;
    for row in dataset.rows.iter_mut() {
        for header in &dataset.headers {
            let Some(cell) = row.get_mut(header) else { continue };
            let converted = standardize_cell(cell);
            if converted.is_number() {
                numeric += 1;
            } else if matches!((&*cell, &converted), (Value::String(before), Value::String(after)) if before.trim() != after)
            {
                dates += 1;
            }
            *cell = converted;
        }
    }
    (numeric, dates)
}

/// Trim, then number, then date, otherwise the trimmed string.
pub fn standardize_cell(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::String(String::new());
            }
            if let Some(n) = parse_number(trimmed) {
                return Value::Number(n);
            }
            if let Some(ts) = parse_date(trimmed) {
                return Value::String(ts);
            }
            Value::String(trimmed.to_string())
        }
        other => other.clone(),
    }
}

pub fn parse_number(text: &str) -> Option<Number> {
    if !NUMERIC_TEXT.is_match(text) {
        return None;
    }
    let is_integral = !text.contains(['.', 'e', 'E']);
    if is_integral {
        if let Ok(i) = text.parse::<i64>() {
            return Some(Number::from(i));
        }
    }
    text.parse::<f64>().ok().filter(|f| f.is_finite()).and_then(Number::from_f64)
}

/// Parse common date layouts into `YYYY-MM-DDTHH:MM:SS.sssZ` (UTC).
pub fn parse_date(text: &str) -> Option<String> {
    let to_iso = |dt: DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::Millis, true);

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(to_iso(dt.with_timezone(&Utc)));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(to_iso(naive.and_utc()));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| to_iso(naive.and_utc()));
        }
    }
    None
}

/// Convenience wrapper for callers holding loose headers and rows.
pub fn preprocess_data(headers: Vec<String>, rows: Vec<Row>, options: &PreprocessOptions) -> PreprocessOutcome {
    Preprocessor::default().run(Dataset::new(headers, rows), options)
}
