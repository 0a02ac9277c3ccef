//! NL-to-SQL chat engine
//!
//! One chat turn walks a fixed sequence of states:
//!
//! ```text
//! Received -> SchemaLookup -> [IntentClassify -> PreprocessSqlGen] -> ContextBuild
//!   -> LlmGenerate -> ParseJson -> [LlmRepair -> ParseJson] -> SqlPatch
//!   -> SqlExecute -> ResultNormalize -> Respond
//! ```
//!
//! Only authorization and lookup failures surface as errors. Model output that
//! isn't JSON, an unreachable model, and failing SQL all still produce a
//! `ChatResponse`; SQL failures travel in `sql_error`.

use crate::chart::{normalize_chart, ChartConfig, ChartData};
use crate::config::EngineConfig;
use crate::dataset::{Row, SYSTEM_COLUMNS};
use crate::error::{AnalystError, Result};
use crate::files::{FileCatalog, FileRecord};
use crate::intent::{Intent, IntentRouter};
use crate::llm::{clean_json_response, complete_with_timeout, ChatTurn, CompletionRequest, CompletionService};
use crate::session::Session;
use crate::sql_patch::{ensure_read_only, ensure_scoped_to, trim_statement, SqlPatcher};
use crate::table_store::{quote_ident, validate_table_name, with_deadline, ColumnSchema, SqlExecutor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REPAIR_PROMPT: &str = "Return ONLY valid JSON. No explanations, no markdown.";
const NO_ROWS: &str = "No rows returned";
const MODEL_UNAVAILABLE: &str =
    "I couldn't get an answer from the language model right now. Please try again in a moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Received,
    SchemaLookup,
    IntentClassify,
    PreprocessSqlGen,
    ContextBuild,
    LlmGenerate,
    ParseJson,
    LlmRepair,
    SqlPatch,
    SqlExecute,
    ResultNormalize,
    Respond,
}

/// A validated chat request.
#[derive(Debug, Clone)]
pub struct ChatQuery {
    pub message: String,
    pub file_id: Uuid,
    pub table_name: String,
    pub history: Vec<ChatTurn>,
}

/// Rows, or a message such as "No rows returned".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    Rows(Vec<Row>),
    Message(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnDebug {
    pub raw_response: String,
    pub repaired: bool,
    pub intent: Option<Intent>,
    pub states: Vec<TurnState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub explanation: String,
    pub sql: Option<String>,
    pub result: Option<QueryResult>,
    pub sql_error: Option<String>,
    pub chart_data: Option<ChartData>,
    pub debug: TurnDebug,
}

/// What the model proposed for this turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub sql: Option<String>,
    pub explanation: String,
    pub chart_config: Option<ChartConfig>,
}

/// Lenient parse of `{sql, explanation, chartConfig}`. Only non-objects and
/// invalid JSON fail; a malformed chart config is dropped.
pub fn parse_model_reply(text: &str) -> Option<ModelReply> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;

    let sql = obj
        .get("sql")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let explanation = obj
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let chart_config = obj
        .get("chartConfig")
        .filter(|v| !v.is_null())
        .and_then(|v| match serde_json::from_value::<ChartConfig>(v.clone()) {
            Ok(config) => Some(config),
            Err(e) => {
                debug!("Dropping unusable chartConfig: {}", e);
                None
            }
        });

    Some(ModelReply { sql, explanation, chart_config })
}

struct TurnContext {
    /// A preprocessing view stands in for the table this turn.
    filtered: bool,
    row_count: Option<u64>,
    sample: Vec<Row>,
}

pub struct ChatQueryEngine {
    llm: Arc<dyn CompletionService>,
    executor: Arc<dyn SqlExecutor>,
    files: Arc<dyn FileCatalog>,
    router: IntentRouter,
    config: EngineConfig,
}

impl ChatQueryEngine {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        executor: Arc<dyn SqlExecutor>,
        files: Arc<dyn FileCatalog>,
        config: EngineConfig,
    ) -> Self {
        let router = IntentRouter::new(llm.clone(), config.llm_timeout);
        Self { llm, executor, files, router, config }
    }

    pub async fn handle_turn(&self, session: &Session, query: ChatQuery) -> Result<ChatResponse> {
        let mut debug_info = TurnDebug::default();
        enter(&mut debug_info, TurnState::Received);

        // Ownership is settled before any model or SQL cost.
        let file = self.authorize(session, &query).await?;
        let table = file.table_name.as_str();

        enter(&mut debug_info, TurnState::SchemaLookup);
        let columns = self.bounded(self.executor.describe_columns(table)).await?;
        if columns.is_empty() {
            return Err(AnalystError::NotFound(format!("Table {} not found", table)));
        }

        let mut view = None;
        if self.config.intent_classification {
            enter(&mut debug_info, TurnState::IntentClassify);
            let intent = self.router.classify(&query.message).await;
            debug_info.intent = Some(intent);
            if intent == Intent::Preprocess {
                enter(&mut debug_info, TurnState::PreprocessSqlGen);
                match self.router.preprocessing_select(&query.message, table, &columns).await {
                    Ok(sql) => view = Some(sql),
                    Err(e) => warn!("Preprocessing SELECT unavailable, querying the stored table: {}", e),
                }
            }
        }

        enter(&mut debug_info, TurnState::ContextBuild);
        let context = self.build_context(&session.user_id, table, view.as_deref()).await;
        let system_prompt = build_system_prompt(&file, &columns, &context);
        let mut messages = recent_history(&query.history, self.config.history_limit);
        messages.push(ChatTurn::user(query.message.clone()));

        enter(&mut debug_info, TurnState::LlmGenerate);
        let request = CompletionRequest::new(system_prompt, messages).max_tokens(400).temperature(0.2);
        let raw = match complete_with_timeout(self.llm.as_ref(), request, self.config.llm_timeout).await {
            Ok(text) => clean_json_response(&text),
            Err(e) => {
                warn!("Primary generation failed: {}", e);
                enter(&mut debug_info, TurnState::Respond);
                return Ok(ChatResponse {
                    explanation: MODEL_UNAVAILABLE.to_string(),
                    sql: None,
                    result: None,
                    sql_error: None,
                    chart_data: None,
                    debug: debug_info,
                });
            }
        };
        debug!("Model output: {}", raw);
        debug_info.raw_response = raw.clone();

        enter(&mut debug_info, TurnState::ParseJson);
        let reply = match parse_model_reply(&raw) {
            Some(reply) => reply,
            None => {
                enter(&mut debug_info, TurnState::LlmRepair);
                debug_info.repaired = true;
                let repaired = self.repair(&raw).await;
                enter(&mut debug_info, TurnState::ParseJson);
                repaired.as_deref().and_then(parse_model_reply).unwrap_or_else(|| {
                    warn!("Model output is not JSON after repair, returning it as text");
                    ModelReply { sql: None, explanation: raw.clone(), chart_config: None }
                })
            }
        };

        let mut response = ChatResponse {
            explanation: reply.explanation,
            sql: None,
            result: None,
            sql_error: None,
            chart_data: None,
            debug: TurnDebug::default(),
        };

        if let Some(sql) = reply.sql {
            enter(&mut debug_info, TurnState::SqlPatch);
            let mut patcher = SqlPatcher::new(&columns);
            if let Some(view_sql) = &view {
                patcher = patcher.with_substitution(table, view_sql.clone());
            }
            let patched = trim_statement(&patcher.patch(&sql)).to_string();
            response.sql = Some(patched.clone());

            enter(&mut debug_info, TurnState::SqlExecute);
            match self.execute(&session.user_id, table, &patched).await {
                Ok(rows) if rows.is_empty() => response.result = Some(QueryResult::Message(NO_ROWS.to_string())),
                Ok(rows) => {
                    if let Some(chart) = reply.chart_config.as_ref().filter(|_| rows.len() > 1) {
                        enter(&mut debug_info, TurnState::ResultNormalize);
                        response.chart_data = normalize_chart(&rows, chart, self.config.chart_row_limit);
                    }
                    response.result = Some(QueryResult::Rows(rows));
                }
                Err(e) => {
                    warn!("SQL execution failed: {}", e);
                    response.sql_error = Some(sql_error_message(&e));
                }
            }
        }

        enter(&mut debug_info, TurnState::Respond);
        response.debug = debug_info;
        info!(
            "💬 Turn answered (sql: {}, error: {})",
            response.sql.is_some(),
            response.sql_error.is_some()
        );
        Ok(response)
    }

    async fn authorize(&self, session: &Session, query: &ChatQuery) -> Result<FileRecord> {
        validate_table_name(&query.table_name)?;
        let file = self
            .files
            .find_owned(&session.user_id, query.file_id)
            .await?
            .ok_or_else(|| AnalystError::NotFound("File not found".to_string()))?;
        if file.table_name != query.table_name {
            warn!("File {} does not own table {}", file.id, query.table_name);
            return Err(AnalystError::NotFound("File not found".to_string()));
        }
        Ok(file)
    }

    /// Row count and sample are context only; failures leave them empty.
    async fn build_context(&self, user_id: &str, table: &str, view: Option<&str>) -> TurnContext {
        let relation = match view {
            Some(sql) => format!("({}) AS {}", sql, table),
            None => quote_ident(table),
        };

        let row_count = match self.bounded(self.executor.count_rows(user_id, &relation)).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("Row count unavailable: {}", e);
                None
            }
        };
        let sample = match self
            .bounded(self.executor.sample_rows(user_id, &relation, self.config.sample_rows))
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|mut row| {
                    for system in SYSTEM_COLUMNS {
                        row.remove(system);
                    }
                    row
                })
                .collect(),
            Err(e) => {
                warn!("Sample rows unavailable: {}", e);
                Vec::new()
            }
        };

        TurnContext { filtered: view.is_some(), row_count, sample }
    }

    /// Exactly one attempt at turning `raw` into JSON.
    async fn repair(&self, raw: &str) -> Option<String> {
        let request = CompletionRequest::new(REPAIR_PROMPT, vec![ChatTurn::user(format!("Convert this to valid JSON: {}", raw))])
            .max_tokens(300)
            .temperature(0.0);
        match complete_with_timeout(self.llm.as_ref(), request, self.config.llm_timeout).await {
            Ok(text) => Some(clean_json_response(&text)),
            Err(e) => {
                warn!("Repair call failed: {}", e);
                None
            }
        }
    }

    async fn execute(&self, user_id: &str, table: &str, sql: &str) -> Result<Vec<Row>> {
        ensure_read_only(sql)?;
        ensure_scoped_to(sql, &[table])?;
        info!("Executing SQL: {}", sql);
        self.bounded(self.executor.execute_as(user_id, sql)).await
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_deadline(self.config.sql_timeout, fut).await
    }

    /// Deadline applied to every SQL call.
    pub fn sql_timeout(&self) -> Duration {
        self.config.sql_timeout
    }
}

fn enter(debug_info: &mut TurnDebug, state: TurnState) {
    debug!("Chat turn -> {:?}", state);
    debug_info.states.push(state);
}

/// The last `limit` turns.
pub fn recent_history(history: &[ChatTurn], limit: usize) -> Vec<ChatTurn> {
    let skip = history.len().saturating_sub(limit);
    history[skip..].to_vec()
}

/// Message shown to the user for a failed execution.
fn sql_error_message(err: &AnalystError) -> String {
    match err {
        AnalystError::Database(sqlx::Error::Database(db)) => db.message().to_string(),
        AnalystError::Timeout(secs) => format!("Query timed out after {}s", secs),
        AnalystError::Execution(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn build_system_prompt(file: &FileRecord, columns: &[ColumnSchema], context: &TurnContext) -> String {
    let column_lines = columns
        .iter()
        .filter(|c| !c.is_system())
        .map(|c| format!("- {} ({})", c.name, c.data_type))
        .collect::<Vec<_>>()
        .join("\n");
    let rows = context
        .row_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let sample = if context.sample.is_empty() {
        "Unavailable".to_string()
    } else {
        serde_json::to_string_pretty(&context.sample).unwrap_or_else(|_| "Unavailable".to_string())
    };
    let filter_note = if context.filtered {
        "The user's preprocessing instruction is applied to this table for this turn; the row count and sample reflect it.\n"
    } else {
        ""
    };
    let description = if file.description.trim().is_empty() {
        "No description"
    } else {
        file.description.as_str()
    };

    format!(
        r#"You are a data analyst assistant with access to a PostgreSQL table "{table}".
Query it by name only: FROM {table}
{filter_note}File: {name} ({description})
Rows: {rows}
Columns:
{column_lines}

Sample:
{sample}

When answering:
- ALWAYS return valid JSON like:
  {{
    "sql": "SELECT ...",
    "explanation": "Short, concise answer",
    "chartConfig": {{
      "type": "bar|line|pie|area",
      "title": "Chart Title",
      "xAxis": "column_name",
      "yAxis": "column_name",
      "groupBy": "column_name"
    }}
  }}
- Use "sql": null when no query is needed. chartConfig and groupBy are optional.
- SQL must be a single read-only PostgreSQL SELECT.
- Every column is stored as text: CAST columns to numeric when aggregating (SUM, AVG, MIN, MAX).
- Only output JSON. No markdown, no extra commentary."#,
        table = file.table_name,
        filter_note = filter_note,
        name = file.file_name,
        description = description,
        rows = rows,
        column_lines = column_lines,
        sample = sample,
    )
}
