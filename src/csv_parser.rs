//! CSV Parser - Turns raw CSV text into rows of fields
//!
//! Single left-to-right scan with an `in_quotes` flag. A `""` pair inside
//! quotes emits one literal quote, a comma outside quotes ends the field and
//! a line break outside quotes ends the row. Fields are trimmed and blank
//! lines are dropped. Unbalanced quotes are not an error: the scan simply
//! ends with the flag still set.
//!
//! The parser is header-agnostic; `Dataset::from_parsed_rows` treats the
//! first row as headers.

use crate::error::Result;
use serde_json::Value;

pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_content = false;

    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                has_content = true;
                if in_quotes && chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => {
                has_content = true;
                row.push(current.trim().to_string());
                current.clear();
            }
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {
                // \r\n: the \n arm ends the row
            }
            '\n' if !in_quotes => {
                finish_row(&mut rows, &mut row, &mut current, has_content);
                has_content = false;
            }
            other => {
                if !other.is_whitespace() {
                    has_content = true;
                }
                current.push(other);
            }
        }
    }
    finish_row(&mut rows, &mut row, &mut current, has_content);

    rows
}

fn finish_row(rows: &mut Vec<Vec<String>>, row: &mut Vec<String>, current: &mut String, has_content: bool) {
    if has_content {
        row.push(current.trim().to_string());
        rows.push(std::mem::take(row));
    } else {
        row.clear();
    }
    current.clear();
}

/// Serialize headers and rows back to CSV text, quoting where needed.
pub fn to_csv(headers: &[String], rows: &[serde_json::Map<String, Value>]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        let record: Vec<String> = headers
            .iter()
            .map(|h| row.get(h).map(cell_to_text).unwrap_or_default())
            .collect();
        writer.write_record(&record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| crate::error::AnalystError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).trim_end_matches('\n').to_string())
}

/// Text form of a cell as it is stored in a text column.
pub fn cell_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
