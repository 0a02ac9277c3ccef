//! Intent routing for chat turns
//!
//! A message either asks a question about the data (`query`) or asks to
//! reshape it first (`preprocess`, e.g. "ignore rows without an amount").
//! Preprocess instructions become a read-only SELECT that the rest of the
//! turn uses in place of the stored table.

use crate::error::{AnalystError, Result};
use crate::llm::{clean_json_response, complete_with_timeout, ChatTurn, CompletionRequest, CompletionService};
use crate::sql_patch::{ensure_read_only, ensure_scoped_to, strip_except, trim_statement};
use crate::table_store::ColumnSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CLASSIFY_PROMPT: &str = "You route messages for a data analysis assistant.
Reply with exactly one word:
- preprocess: the user wants to clean, filter, drop or reshape the dataset before analysis
- query: the user asks a question about the data
No other text.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Query,
    Preprocess,
}

impl Intent {
    /// Anything that doesn't clearly say `preprocess` is a query.
    pub fn from_reply(reply: &str) -> Self {
        let word = reply.trim().trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
        if word == "preprocess" {
            Intent::Preprocess
        } else {
            Intent::Query
        }
    }
}

pub struct IntentRouter {
    llm: Arc<dyn CompletionService>,
    timeout: Duration,
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn CompletionService>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Classification failures fall back to `Query`.
    pub async fn classify(&self, message: &str) -> Intent {
        let request = CompletionRequest::new(CLASSIFY_PROMPT, vec![ChatTurn::user(message)])
            .max_tokens(5)
            .temperature(0.0);
        match complete_with_timeout(self.llm.as_ref(), request, self.timeout).await {
            Ok(reply) => {
                let intent = Intent::from_reply(&reply);
                info!("Intent: {:?}", intent);
                intent
            }
            Err(e) => {
                warn!("Intent classification failed, treating as query: {}", e);
                Intent::Query
            }
        }
    }

    /// Translate a preprocessing instruction into a read-only SELECT over `table`.
    pub async fn preprocessing_select(&self, message: &str, table: &str, columns: &[ColumnSchema]) -> Result<String> {
        let data_columns: Vec<String> = columns.iter().filter(|c| !c.is_system()).map(|c| c.name.clone()).collect();
        let column_list = columns
            .iter()
            .filter(|c| !c.is_system())
            .map(|c| format!("- {} ({})", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join("\n");

        let system_prompt = format!(
            "Translate the user's data preparation instruction into ONE read-only PostgreSQL SELECT \
over the table \"{table}\".
Columns:
{column_list}

Rules:
- Project only the columns that make sense to keep; list them explicitly.
- Filter rows with WHERE when asked. Never modify data.
- Do not use EXCEPT. Do not use semicolons.
- Return ONLY JSON: {{\"sql\": \"SELECT ...\"}}"
        );

        let request = CompletionRequest::new(system_prompt, vec![ChatTurn::user(message)])
            .max_tokens(300)
            .temperature(0.0);
        let raw = complete_with_timeout(self.llm.as_ref(), request, self.timeout).await?;

        let sql = extract_sql(&raw)
            .ok_or_else(|| AnalystError::Llm("No SQL in preprocessing response".to_string()))?;
        let sql = trim_statement(&strip_except(&sql, &data_columns)).to_string();
        ensure_read_only(&sql)?;
        ensure_scoped_to(&sql, &[table])?;
        info!("Preprocessing view: {}", sql);
        Ok(sql)
    }
}

/// `{"sql": "..."}` or a bare statement.
fn extract_sql(raw: &str) -> Option<String> {
    let cleaned = clean_json_response(raw);
    let text = match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Object(obj)) => obj.get("sql").and_then(Value::as_str)?.to_string(),
        _ => cleaned.trim_start_matches("```sql").trim_end_matches("```").trim().to_string(),
    };
    (!text.is_empty()).then_some(text)
}
