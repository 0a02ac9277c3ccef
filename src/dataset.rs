//! In-memory dataset used during the upload flow
//!
//! Rows are JSON objects keyed by header so that parsed strings and
//! preprocessed numbers share one representation.

use crate::error::{AnalystError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

pub type Row = Map<String, Value>;

/// Columns every stored table carries besides the CSV columns.
pub const SYSTEM_COLUMNS: [&str; 3] = ["id", "created_at", "owner_id"];

lazy_static! {
    static ref NON_IDENT: Regex = Regex::new(r"[^a-z0-9_]").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(headers: Vec<String>, rows: Vec<Row>) -> Self {
        Self { headers, rows }
    }

    /// Build a dataset from parser output. The first row is the header row;
    /// data rows whose arity differs from it are dropped. Returns the dataset
    /// and the number of dropped rows.
    pub fn from_parsed_rows(parsed: Vec<Vec<String>>) -> Result<(Self, usize)> {
        let mut iter = parsed.into_iter();
        let header_row = iter
            .next()
            .ok_or_else(|| AnalystError::Validation("CSV file is empty".to_string()))?;

        let headers: Vec<String> = header_row
            .iter()
            .map(|h| h.replace('"', "").trim().to_string())
            .collect();

        let mut dropped = 0;
        let mut rows = Vec::new();
        for fields in iter {
            if fields.len() != headers.len() {
                dropped += 1;
                continue;
            }
            let row: Row = headers
                .iter()
                .cloned()
                .zip(fields.into_iter().map(Value::String))
                .collect();
            rows.push(row);
        }

        Ok((Self { headers, rows }, dropped))
    }

    pub fn from_csv_text(text: &str) -> Result<(Self, usize)> {
        if text.trim().is_empty() {
            return Err(AnalystError::Validation("CSV content is empty".to_string()));
        }
        Self::from_parsed_rows(crate::csv_parser::parse_csv(text))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Keep only `headers` in every row, in header order.
    pub fn project(&mut self, headers: Vec<String>) {
        self.rows = self
            .rows
            .iter()
            .map(|row| {
                headers
                    .iter()
                    .map(|h| (h.clone(), row.get(h).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();
        self.headers = headers;
    }
}

/// A value is missing iff it is null or a string that is empty after trimming.
/// Numeric zero and "0" are present.
pub fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Serialized identity of a row, independent of key order.
pub fn row_key(row: &Row) -> String {
    let sorted: BTreeMap<&String, &Value> = row.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// Lowercase, replace anything outside `[a-z0-9_]` with `_`.
pub fn sanitize_identifier(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let mut ident = NON_IDENT.replace_all(&lowered, "_").to_string();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident = format!("col_{}", ident);
    }
    if SYSTEM_COLUMNS.contains(&ident.as_str()) {
        ident.push_str("_value");
    }
    ident
}

/// Sanitize every header and make the results unique by suffixing `_2`, `_3`, ...
pub fn sanitize_headers(headers: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    headers
        .iter()
        .map(|h| {
            let base = sanitize_identifier(h);
            let mut candidate = base.clone();
            let mut n = 2;
            while seen.contains(&candidate) {
                candidate = format!("{}_{}", base, n);
                n += 1;
            }
            seen.insert(candidate.clone());
            candidate
        })
        .collect()
}
