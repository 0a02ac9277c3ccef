//! Data Quality Analyzer
//!
//! Pure summary statistics over a dataset. Recomputed from scratch whenever
//! the dataset changes; nothing here is cached.

use crate::dataset::{is_missing, row_key, Row};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Columns whose missing ratio exceeds this are low-value.
pub const DEFAULT_LOW_VALUE_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQualitySummary {
    pub total_rows: usize,
    pub total_columns: usize,
    pub duplicate_count: usize,
    pub empty_row_count: usize,
    pub missing_value_summary: HashMap<String, usize>,
    pub low_value_columns: Vec<String>,
    pub rows_with_missing_values: usize,
}

#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    low_value_threshold: f64,
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_VALUE_THRESHOLD)
    }
}

impl QualityAnalyzer {
    pub fn new(low_value_threshold: f64) -> Self {
        Self { low_value_threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.low_value_threshold
    }

    pub fn analyze(&self, headers: &[String], rows: &[Row]) -> DataQualitySummary {
        let total_rows = rows.len();
        let mut seen: HashSet<String> = HashSet::new();
        let mut duplicate_count = 0;
        let mut empty_row_count = 0;
        let mut rows_with_missing_values = 0;
        let mut missing_value_summary: HashMap<String, usize> =
            headers.iter().map(|h| (h.clone(), 0)).collect();

        for row in rows {
            if !seen.insert(row_key(row)) {
                duplicate_count += 1;
            }

            let mut row_has_missing = false;
            let mut non_empty = 0;
            for header in headers {
                if is_missing(row.get(header)) {
                    *missing_value_summary.entry(header.clone()).or_insert(0) += 1;
                    row_has_missing = true;
                } else {
                    non_empty += 1;
                }
            }

            if row_has_missing {
                rows_with_missing_values += 1;
            }
            if non_empty == 0 {
                empty_row_count += 1;
            }
        }

        // An empty dataset has no low-value columns
        let low_value_columns = if total_rows == 0 {
            Vec::new()
        } else {
            headers
                .iter()
                .filter(|h| {
                    let missing = missing_value_summary.get(*h).copied().unwrap_or(0);
                    missing as f64 / total_rows as f64 > self.low_value_threshold
                })
                .cloned()
                .collect()
        };

        DataQualitySummary {
            total_rows,
            total_columns: headers.len(),
            duplicate_count,
            empty_row_count,
            missing_value_summary,
            low_value_columns,
            rows_with_missing_values,
        }
    }
}

/// Summary with the default 30% threshold.
pub fn generate_data_quality_summary(headers: &[String], rows: &[Row]) -> DataQualitySummary {
    QualityAnalyzer::default().analyze(headers, rows)
}
