//! Service configuration
//!
//! Values come from the process environment (a `.env` file is loaded by the
//! server binary first). Everything except the database URL and the API key
//! has a default.

use crate::error::{AnalystError, Result};
use crate::table_store::AccessPolicy;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

lazy_static! {
    static ref ROLE_NAME: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap();
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub bind_addr: String,
    pub max_connections: u32,
    pub llm_timeout_secs: u64,
    pub sql_timeout_secs: u64,
    pub engine: EngineConfig,
    pub low_value_threshold: f64,
    pub object_store_dir: PathBuf,
    pub access_policy: AccessPolicy,
    /// Role chat SQL runs as; `QUERY_ROLE=none` keeps the connection's own role.
    pub query_role: Option<String>,
}

/// Knobs of the chat query engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub history_limit: usize,
    pub sample_rows: usize,
    pub chart_row_limit: usize,
    pub intent_classification: bool,
    pub llm_timeout: Duration,
    pub sql_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: 30,
            sample_rows: 5,
            chart_row_limit: 50,
            intent_classification: true,
            llm_timeout: Duration::from_secs(30),
            sql_timeout: Duration::from_secs(15),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let openai_api_key = required("OPENAI_API_KEY")?;

        let llm_timeout_secs = parsed("LLM_TIMEOUT_SECS", 30u64)?;
        let sql_timeout_secs = parsed("SQL_TIMEOUT_SECS", 15u64)?;

        let engine = EngineConfig {
            history_limit: parsed("CHAT_HISTORY_LIMIT", 30usize)?,
            sample_rows: parsed("CONTEXT_SAMPLE_ROWS", 5usize)?,
            chart_row_limit: parsed("CHART_ROW_LIMIT", 50usize)?,
            intent_classification: parsed("INTENT_CLASSIFICATION", true)?,
            llm_timeout: Duration::from_secs(llm_timeout_secs),
            sql_timeout: Duration::from_secs(sql_timeout_secs),
        };

        let config = Self {
            database_url,
            openai_api_key,
            openai_base_url: optional("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_model: optional("OPENAI_MODEL", "gpt-4o-mini"),
            bind_addr: optional("BIND_ADDR", "0.0.0.0:8080"),
            max_connections: parsed("MAX_CONNECTIONS", 10u32)?,
            llm_timeout_secs,
            sql_timeout_secs,
            engine,
            low_value_threshold: parsed("LOW_VALUE_THRESHOLD", 0.30f64)?,
            object_store_dir: PathBuf::from(optional("OBJECT_STORE_DIR", "./csv-files")),
            access_policy: parsed("TABLE_ACCESS_POLICY", AccessPolicy::OwnerScoped)?,
            query_role: query_role(&optional("QUERY_ROLE", "csv_reader")),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.low_value_threshold > 0.0 && self.low_value_threshold <= 1.0) {
            return Err(AnalystError::Config(format!(
                "LOW_VALUE_THRESHOLD must be in (0, 1], got {}",
                self.low_value_threshold
            )));
        }
        if self.llm_timeout_secs == 0 || self.sql_timeout_secs == 0 {
            return Err(AnalystError::Config("timeouts must be at least one second".to_string()));
        }
        if self.engine.history_limit == 0 {
            return Err(AnalystError::Config("CHAT_HISTORY_LIMIT must be positive".to_string()));
        }
        if let Some(role) = &self.query_role {
            if !ROLE_NAME.is_match(role) {
                return Err(AnalystError::Config(format!("invalid QUERY_ROLE '{}'", role)));
            }
        }
        if self.max_connections == 0 {
            return Err(AnalystError::Config("MAX_CONNECTIONS must be positive".to_string()));
        }
        Ok(())
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AnalystError::Config(format!("{} is not set", key)))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn query_role(raw: &str) -> Option<String> {
    let role = raw.trim();
    if role.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(role.to_string())
    }
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AnalystError::Config(format!("invalid {}='{}': {}", key, raw, e))),
        _ => Ok(default),
    }
}
