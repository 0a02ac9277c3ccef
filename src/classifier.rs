//! AI Column Classifier
//!
//! Sends headers and a few sample rows to the LLM to get a dataset summary,
//! the columns holding personal contact data and the money columns. Output
//! is advisory: preprocessing acts on `email_columns` / `currency_columns`
//! names only. A reply that isn't JSON degrades to `summary = raw text`
//! with empty column lists.

use crate::dataset::Row;
use crate::error::Result;
use crate::llm::{clean_json_response, complete_with_timeout, ChatTurn, CompletionRequest, CompletionService};
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const MAX_SAMPLE_ROWS: usize = 5;

const MONEY_WORDS: [&str; 9] = [
    "amount", "price", "cost", "total", "revenue", "salary", "fee", "payment", "balance",
];

lazy_static! {
    static ref CURRENCY_MARK: Regex =
        Regex::new(r"[$€£¥₹₨₩₽]|\b(USD|EUR|GBP|INR|PKR|JPY|AUD|CAD|Rs)\b").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyColumn {
    pub name: String,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnClassification {
    pub summary: String,
    #[serde(default)]
    pub email_columns: Vec<String>,
    #[serde(default)]
    pub currency_columns: Vec<CurrencyColumn>,
    #[serde(default)]
    pub modified_headers: Vec<String>,
}

impl ColumnClassification {
    pub fn fallback(summary: String, headers: &[String]) -> Self {
        Self {
            summary,
            email_columns: Vec::new(),
            currency_columns: Vec::new(),
            modified_headers: headers.to_vec(),
        }
    }
}

pub struct ColumnClassifier {
    llm: Arc<dyn CompletionService>,
    timeout: Duration,
}

impl ColumnClassifier {
    pub fn new(llm: Arc<dyn CompletionService>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Classify columns from a sample of `rows`. Only an LLM transport failure
    /// is returned as an error; unparsable output degrades.
    pub async fn classify(
        &self,
        headers: &[String],
        rows: &[Row],
        preprocessing_steps: &[String],
    ) -> Result<ColumnClassification> {
        let sample = select_sample_rows(rows, MAX_SAMPLE_ROWS);
        let prompt = build_prompt(headers, &sample, preprocessing_steps);

        let request = CompletionRequest::new(
            "You are a helpful data analyst assistant.",
            vec![ChatTurn::user(prompt)],
        )
        .max_tokens(500)
        .temperature(0.3);

        let raw = complete_with_timeout(self.llm.as_ref(), request, self.timeout).await?;
        let classification = parse_classification(&raw, headers);
        let classification = enforce_column_policy(classification, headers, &sample);

        info!(
            "Classified {} columns: {} contact, {} currency",
            headers.len(),
            classification.email_columns.len(),
            classification.currency_columns.len()
        );
        Ok(classification)
    }
}

/// Up to `limit` random rows having at least one non-empty string value.
pub fn select_sample_rows(rows: &[Row], limit: usize) -> Vec<Row> {
    let mut candidates: Vec<&Row> = rows
        .iter()
        .filter(|r| r.values().any(|v| matches!(v, Value::String(s) if !s.trim().is_empty())))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.into_iter().take(limit).cloned().collect()
}

fn build_prompt(headers: &[String], sample: &[Row], preprocessing_steps: &[String]) -> String {
    let preview = sample
        .iter()
        .enumerate()
        .map(|(i, row)| format!("{}. {}", i + 1, Value::Object(row.clone())))
        .collect::<Vec<_>>()
        .join("\n");

    let preprocessing_note = if preprocessing_steps.is_empty() {
        String::new()
    } else {
        format!(
            "Note: The following preprocessing has already been applied to the dataset:\n- {}",
            preprocessing_steps.join("\n- ")
        )
    };

    format!(
        r#"You are a data analyst assistant.
You are given CSV headers and a few sample rows.
Provide a high-level human-readable summary of what this dataset seems to represent.
Do not assume column types or units. Do not mention values in the rows. Plain text only.

{}

Additionally:
- Identify columns that likely contain email addresses or mobile numbers and return them as a list.
- Identify columns that contain or indicate currency. Only mark a column as currency if:
  1) The column name explicitly suggests money (e.g., amount, price, cost, total), OR
  2) The values contain currency symbols (e.g., $, ₹, €, PKR, INR).
- Do NOT treat numeric columns like Quantity, Count, or Units as currency even if other columns contain currency symbols.
- For each currency column, include the detected currency name or symbol.
- Suggest modified headers where currency columns are renamed as 'column_name (currency)'.

Return a JSON object like this:
{{
  "summary": "High-level description of dataset including preprocessing notes",
  "emailColumns": ["column1"],
  "currencyColumns": [{{ "name": "column3", "currency": "USD" }}],
  "modifiedHeaders": ["col1", "col3 (USD)"]
}}

Headers: {}
Sample Rows:
{}"#,
        preprocessing_note,
        headers.join(", "),
        preview
    )
}

/// Parse model output. Accepts currency columns either as objects or bare names.
pub fn parse_classification(raw: &str, headers: &[String]) -> ColumnClassification {
    let cleaned = clean_json_response(raw);
    let value: Value = match serde_json::from_str(&cleaned) {
        Ok(v @ Value::Object(_)) => v,
        _ => {
            warn!("Failed to parse classifier JSON, returning raw text summary");
            return ColumnClassification::fallback(raw.trim().to_string(), headers);
        }
    };

    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or("No summary")
        .to_string();

    let email_columns = value
        .get("emailColumns")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(column_name).collect())
        .unwrap_or_default();

    let currency_columns = value
        .get("currencyColumns")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(name) => Some(CurrencyColumn {
                        name: name.clone(),
                        currency: "unknown".to_string(),
                    }),
                    Value::Object(_) => serde_json::from_value(item.clone()).ok(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let modified_headers = value
        .get("modifiedHeaders")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_else(|| headers.to_vec());

    ColumnClassification {
        summary,
        email_columns,
        currency_columns,
        modified_headers,
    }
}

fn column_name(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Drop suggestions naming columns that don't exist, and currency columns
/// whose name has no money word and whose sampled values carry no currency mark.
pub fn enforce_column_policy(
    mut classification: ColumnClassification,
    headers: &[String],
    sample: &[Row],
) -> ColumnClassification {
    classification.email_columns.retain(|c| headers.contains(c));
    classification.currency_columns.retain(|col| {
        if !headers.contains(&col.name) {
            return false;
        }
        let keep = name_suggests_money(&col.name) || sample_has_currency_mark(sample, &col.name);
        if !keep {
            warn!("Dropping currency suggestion '{}': no monetary indicator", col.name);
        }
        keep
    });
    classification
}

fn name_suggests_money(name: &str) -> bool {
    let lower = name.to_lowercase();
    MONEY_WORDS.iter().any(|w| lower.contains(w))
}

fn sample_has_currency_mark(sample: &[Row], column: &str) -> bool {
    sample.iter().any(|row| match row.get(column) {
        Some(Value::String(s)) => CURRENCY_MARK.is_match(s),
        _ => false,
    })
}
