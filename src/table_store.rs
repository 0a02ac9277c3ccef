//! Dynamic Table Store
//!
//! Every uploaded dataset lands in its own table, `csv_<millis>_<suffix>`,
//! with one unconstrained `TEXT` column per sanitized header. Typing is left
//! to query time: the chat engine casts text columns before aggregating.
//!
//! Tables carry an `owner_id` column and a named row-level security policy.
//! The default policy only shows rows whose owner matches the
//! `app.current_user_id` setting of the executing transaction.

use crate::csv_parser::cell_to_text;
use crate::dataset::{Row, SYSTEM_COLUMNS};
use crate::error::{AnalystError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::error;

/// Session setting the row policy compares `owner_id` against.
pub const CURRENT_USER_SETTING: &str = "app.current_user_id";

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

lazy_static! {
    static ref TABLE_NAME: Regex = Regex::new(r"^csv_\d+_[a-z0-9]+$").unwrap();
}

/// Row-visibility rule attached to a table when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    /// Rows are visible to, and writable by, their owner only.
    #[default]
    OwnerScoped,
    /// `USING (true)`: any role that can reach the table sees every row.
    Permissive,
}

impl AccessPolicy {
    pub fn policy_name(&self, table: &str) -> String {
        match self {
            AccessPolicy::OwnerScoped => format!("{}_owner_rows", table),
            AccessPolicy::Permissive => format!("{}_all_rows", table),
        }
    }

    fn predicate(&self) -> String {
        match self {
            AccessPolicy::OwnerScoped => {
                format!("owner_id = current_setting('{}', true)", CURRENT_USER_SETTING)
            }
            AccessPolicy::Permissive => "true".to_string(),
        }
    }
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPolicy::OwnerScoped => write!(f, "owner_scoped"),
            AccessPolicy::Permissive => write!(f, "permissive"),
        }
    }
}

impl FromStr for AccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "owner_scoped" | "owner" => Ok(AccessPolicy::OwnerScoped),
            "permissive" => Ok(AccessPolicy::Permissive),
            other => Err(format!("unknown access policy '{}' (expected owner_scoped or permissive)", other)),
        }
    }
}

/// One column as reported by the database catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

impl ColumnSchema {
    pub fn is_textual(&self) -> bool {
        let ty = self.data_type.to_lowercase();
        ty.contains("text") || ty.contains("character")
    }

    pub fn is_system(&self) -> bool {
        SYSTEM_COLUMNS.contains(&self.name.as_str())
    }
}

/// Creation and bulk insertion of per-upload tables.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Fails if the table already exists.
    async fn create_text_table(&self, name: &str, columns: &[String], policy: AccessPolicy) -> Result<()>;

    /// Insert rows as `owner_id`; returns the number of rows written.
    async fn insert_rows(&self, name: &str, owner_id: &str, columns: &[String], rows: &[Vec<Option<String>>])
        -> Result<u64>;

    async fn drop_table(&self, name: &str) -> Result<()>;
}

/// Read access to stored tables on behalf of a user.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a read query with the caller's identity applied to row policies.
    /// Rows come back as JSON objects in select-list order.
    async fn execute_as(&self, user_id: &str, sql: &str) -> Result<Vec<Row>>;

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnSchema>>;

    /// `relation` is a table name or a parenthesized subquery with an alias.
    async fn count_rows(&self, user_id: &str, relation: &str) -> Result<u64> {
        let rows = self
            .execute_as(user_id, &format!("SELECT COUNT(*) AS count FROM {}", relation))
            .await?;
        let count = rows.first().and_then(|r| r.get("count"));
        Ok(match count {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        })
    }

    async fn sample_rows(&self, user_id: &str, relation: &str, limit: usize) -> Result<Vec<Row>> {
        self.execute_as(user_id, &format!("SELECT * FROM {} LIMIT {}", relation, limit))
            .await
    }

    /// One page of data columns, in insertion order. `page` is 1-based.
    async fn fetch_page(
        &self,
        user_id: &str,
        table: &str,
        columns: &[String],
        page: u32,
        limit: u32,
    ) -> Result<Vec<Row>> {
        validate_table_name(table)?;
        let select_list = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        };
        let offset = u64::from(page.saturating_sub(1)) * u64::from(limit);
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id LIMIT {} OFFSET {}",
            select_list,
            quote_ident(table),
            limit,
            offset
        );
        self.execute_as(user_id, &sql).await
    }
}

/// `csv_<epoch millis>_<9 random [a-z0-9]>`.
pub fn generate_table_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("csv_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

pub fn validate_table_name(name: &str) -> Result<()> {
    if TABLE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(AnalystError::Validation(format!("Invalid table name: {}", name)))
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// DDL for a new table: create, enable and force RLS, attach the policy.
pub fn create_table_statements(name: &str, columns: &[String], policy: AccessPolicy) -> Vec<String> {
    let table = quote_ident(name);
    let mut defs = vec![
        "id BIGSERIAL PRIMARY KEY".to_string(),
        "created_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string(),
        "owner_id TEXT NOT NULL".to_string(),
    ];
    defs.extend(columns.iter().map(|c| format!("{} TEXT", quote_ident(c))));

    let predicate = policy.predicate();
    vec![
        format!("CREATE TABLE {} ({})", table, defs.join(", ")),
        format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY", table),
        format!("ALTER TABLE {} FORCE ROW LEVEL SECURITY", table),
        format!(
            "CREATE POLICY {} ON {} FOR ALL USING ({}) WITH CHECK ({})",
            quote_ident(&policy.policy_name(name)),
            table,
            predicate,
            predicate
        ),
    ]
}

/// Lets `role` read `table`; row policies still apply to it.
pub fn grant_read_statement(table: &str, role: &str) -> String {
    format!("GRANT SELECT ON {} TO {}", quote_ident(table), quote_ident(role))
}

/// Run an SQL call with a deadline; expiry becomes `AnalystError::Timeout`.
pub async fn with_deadline<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            error!("SQL call exceeded {}s", limit.as_secs());
            Err(AnalystError::Timeout(limit.as_secs()))
        }
    }
}

/// Cell values of `row` in `keys` order. Null and absent cells become SQL NULL.
pub fn row_values(keys: &[String], row: &Row) -> Vec<Option<String>> {
    keys.iter()
        .map(|k| match row.get(k) {
            None | Some(Value::Null) => None,
            Some(v) => Some(cell_to_text(v)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_names_are_valid_and_distinct() {
        let a = generate_table_name();
        let b = generate_table_name();
        assert!(validate_table_name(&a).is_ok(), "{}", a);
        assert_ne!(a, b);
        assert_eq!(a.rsplit('_').next().map(str::len), Some(9));
    }

    #[test]
    fn test_validate_table_name_rejects_injection() {
        assert!(validate_table_name("csv_1700000000000_abc123xyz").is_ok());
        assert!(validate_table_name("users").is_err());
        assert!(validate_table_name("csv_1_a; DROP TABLE files").is_err());
        assert!(validate_table_name("CSV_1_ABC").is_err());
    }

    #[test]
    fn test_owner_scoped_ddl() {
        let stmts = create_table_statements(
            "csv_1_abc",
            &["name".to_string(), "amount".to_string()],
            AccessPolicy::OwnerScoped,
        );
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].starts_with("CREATE TABLE \"csv_1_abc\" (id BIGSERIAL PRIMARY KEY"));
        assert!(stmts[0].contains("owner_id TEXT NOT NULL, \"name\" TEXT, \"amount\" TEXT"));
        assert!(!stmts[0].contains("IF NOT EXISTS"));
        assert!(stmts[2].contains("FORCE ROW LEVEL SECURITY"));
        assert!(stmts[3].contains("\"csv_1_abc_owner_rows\""));
        assert!(stmts[3].contains("USING (owner_id = current_setting('app.current_user_id', true))"));
        assert!(stmts[3].contains("WITH CHECK (owner_id"));
    }

    #[test]
    fn test_permissive_policy_is_explicit() {
        let stmts = create_table_statements("csv_1_abc", &[], AccessPolicy::Permissive);
        assert!(stmts[3].contains("\"csv_1_abc_all_rows\""));
        assert!(stmts[3].contains("USING (true)"));
    }

    #[test]
    fn test_access_policy_parsing() {
        assert_eq!("owner_scoped".parse::<AccessPolicy>(), Ok(AccessPolicy::OwnerScoped));
        assert_eq!("Permissive".parse::<AccessPolicy>(), Ok(AccessPolicy::Permissive));
        assert_eq!("owner-scoped".parse::<AccessPolicy>(), Ok(AccessPolicy::OwnerScoped));
        assert!("open".parse::<AccessPolicy>().is_err());
        assert_eq!(AccessPolicy::default().to_string(), "owner_scoped");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_row_values() {
        let row: Row = [("a".to_string(), json!(5)), ("b".to_string(), Value::Null)]
            .into_iter()
            .collect();
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(row_values(&keys, &row), vec![Some("5".to_string()), None, None]);
    }

    #[test]
    fn test_grant_read_statement_quotes_both_names() {
        assert_eq!(
            grant_read_statement("csv_1_abc", "csv_reader"),
            "GRANT SELECT ON \"csv_1_abc\" TO \"csv_reader\""
        );
    }

    #[tokio::test]
    async fn test_with_deadline_maps_expiry_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(1u64)
        };
        let result = with_deadline(Duration::from_millis(10), slow).await;
        assert!(matches!(result, Err(AnalystError::Timeout(_))));

        let fast = with_deadline(Duration::from_secs(1), async { Ok(7u64) }).await;
        assert_eq!(fast.ok(), Some(7));
    }

    #[test]
    fn test_column_schema_textual() {
        let col = |ty: &str| ColumnSchema { name: "x".into(), data_type: ty.into(), is_nullable: true };
        assert!(col("text").is_textual());
        assert!(col("character varying").is_textual());
        assert!(!col("numeric").is_textual());
    }
}
