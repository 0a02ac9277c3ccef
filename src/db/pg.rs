//! sqlx implementations of the store, catalog and identity traits.

use crate::dataset::Row;
use crate::error::{AnalystError, Result};
use crate::files::{FileCatalog, FileRecord, FileStatus, NewFile};
use crate::session::{IdentityProvider, Session};
use crate::sql_patch::trim_statement;
use crate::table_store::{
    create_table_statements, grant_read_statement, quote_ident, validate_table_name, AccessPolicy, ColumnSchema, SqlExecutor, TableStore,
    CURRENT_USER_SETTING,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Postgres caps bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Executes reads and owns per-upload tables.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    statement_timeout: Duration,
    query_role: Option<String>,
}

impl PgStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self { pool, statement_timeout, query_role: None }
    }

    /// Run reads as `role`, which may only SELECT from stored tables.
    pub fn with_query_role(mut self, role: Option<String>) -> Self {
        self.query_role = role;
        self
    }

    /// Transaction with the caller's id set for row policies.
    async fn scoped_tx(&self, user_id: &str) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(CURRENT_USER_SETTING)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

#[async_trait]
impl SqlExecutor for PgStore {
    async fn execute_as(&self, user_id: &str, sql: &str) -> Result<Vec<Row>> {
        let wrapped = format!("SELECT COALESCE(json_agg(q), '[]'::json) FROM ({}) q", trim_statement(sql));

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        sqlx::query("SELECT set_config($1, $2, true), set_config('statement_timeout', $3, true)")
            .bind(CURRENT_USER_SETTING)
            .bind(user_id)
            .bind(self.statement_timeout.as_millis().to_string())
            .execute(&mut *tx)
            .await?;
        if let Some(role) = &self.query_role {
            sqlx::query(&format!("SET LOCAL ROLE {}", quote_ident(role)))
                .execute(&mut *tx)
                .await?;
        }

        let value: Value = sqlx::query_scalar(&wrapped).fetch_one(&mut *tx).await?;
        tx.rollback().await?;

        let rows = match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            other => {
                return Err(AnalystError::Execution(format!("Unexpected result shape: {}", other)));
            }
        };
        Ok(rows)
    }

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        validate_table_name(table)?;
        let rows: Vec<(String, String, bool)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text, (is_nullable = 'YES') \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable)| ColumnSchema { name, data_type, is_nullable })
            .collect())
    }
}

#[async_trait]
impl TableStore for PgStore {
    async fn create_text_table(&self, name: &str, columns: &[String], policy: AccessPolicy) -> Result<()> {
        validate_table_name(name)?;
        let mut tx = self.pool.begin().await?;
        for statement in create_table_statements(name, columns, policy) {
            debug!("DDL: {}", statement);
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        if let Some(role) = &self.query_role {
            sqlx::query(&grant_read_statement(name, role)).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("📦 Created table {} ({} columns, {} policy)", name, columns.len(), policy);
        Ok(())
    }

    async fn insert_rows(
        &self,
        name: &str,
        owner_id: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64> {
        validate_table_name(name)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let column_list = std::iter::once("owner_id".to_string())
            .chain(columns.iter().map(|c| quote_ident(c)))
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / (columns.len() + 1)).max(1);

        let mut tx = self.scoped_tx(owner_id).await?;
        let mut inserted = 0;
        for chunk in rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", quote_ident(name), column_list));
            builder.push_values(chunk, |mut b, values| {
                b.push_bind(owner_id.to_string());
                for value in values {
                    b.push_bind(value.clone());
                }
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        info!("Inserted {} rows into {}", inserted, name);
        Ok(inserted)
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        validate_table_name(name)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
            .execute(&self.pool)
            .await?;
        info!("Dropped table {}", name);
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: Uuid,
    owner_id: String,
    folder_id: Option<String>,
    file_name: String,
    description: String,
    table_name: String,
    original_headers: Json<Vec<String>>,
    ai_summary: Option<String>,
    status: String,
    row_count: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = AnalystError;

    fn try_from(row: FileRow) -> Result<Self> {
        let status = row.status.parse::<FileStatus>().map_err(AnalystError::Storage)?;
        Ok(FileRecord {
            id: row.id,
            owner_id: row.owner_id,
            folder_id: row.folder_id,
            file_name: row.file_name,
            description: row.description,
            table_name: row.table_name,
            original_headers: row.original_headers.0,
            ai_summary: row.ai_summary,
            status,
            row_count: row.row_count,
            created_at: row.created_at,
        })
    }
}

const FILE_COLUMNS: &str = "id, owner_id, folder_id, file_name, description, table_name, \
                            original_headers, ai_summary, status, row_count, created_at";

pub struct PgFileCatalog {
    pool: PgPool,
}

impl PgFileCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileCatalog for PgFileCatalog {
    async fn create(&self, file: NewFile) -> Result<FileRecord> {
        let record = file.into_record();
        sqlx::query(
            "INSERT INTO files (id, owner_id, folder_id, file_name, description, table_name, \
             original_headers, ai_summary, status, row_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.id)
        .bind(&record.owner_id)
        .bind(&record.folder_id)
        .bind(&record.file_name)
        .bind(&record.description)
        .bind(&record.table_name)
        .bind(Json(&record.original_headers))
        .bind(&record.ai_summary)
        .bind(record.status.as_str())
        .bind(record.row_count)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_owned(&self, owner_id: &str, id: Uuid) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> =
            sqlx::query_as(&format!("SELECT {} FROM files WHERE id = $1 AND owner_id = $2", FILE_COLUMNS))
                .bind(id)
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn find_by_table(&self, owner_id: &str, table_name: &str) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(&format!(
            "SELECT {} FROM files WHERE table_name = $1 AND owner_id = $2",
            FILE_COLUMNS
        ))
        .bind(table_name)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn list_folder(&self, owner_id: &str, folder_id: Option<&str>) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            "SELECT {} FROM files WHERE owner_id = $1 AND ($2::text IS NULL OR folder_id = $2) \
             ORDER BY created_at DESC",
            FILE_COLUMNS
        ))
        .bind(owner_id)
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    async fn set_status(&self, id: Uuid, status: FileStatus, row_count: i64) -> Result<()> {
        sqlx::query("UPDATE files SET status = $1, row_count = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(row_count)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_pending(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE files SET status = $1 WHERE id = $2 AND status = $3")
            .bind(FileStatus::Storing.as_str())
            .bind(id)
            .bind(FileStatus::Pending.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, owner_id: &str, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Looks bearer tokens up in `user_sessions`.
pub struct PgIdentityProvider {
    pool: PgPool,
}

impl PgIdentityProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityProvider for PgIdentityProvider {
    async fn resolve(&self, token: &str) -> Result<Option<Session>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT user_id, email FROM user_sessions WHERE token = $1 AND expires_at > now()")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id, email)| Session { user_id, email }))
    }
}
