//! Upload flow: register a CSV file, then persist its final rows
//!
//! Registration parses the CSV, keeps the raw text in the object store and
//! creates a `pending` file record naming the table-to-be. Storing claims
//! the record (`pending` to `storing`), creates that table and inserts the
//! rows; when the insert fails the table is dropped again and the record is
//! marked `failed`.

use crate::dataset::{sanitize_headers, Dataset, Row};
use crate::error::{AnalystError, Result};
use crate::files::{FileCatalog, FileRecord, FileStatus, NewFile};
use crate::session::Session;
use crate::storage::ObjectStore;
use crate::table_store::{generate_table_name, row_values, validate_table_name, AccessPolicy, TableStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    #[serde(default)]
    pub description: String,
    pub csv_text: String,
    pub folder_id: Option<String>,
    pub ai_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub success: bool,
    pub file: FileRecord,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    pub table_name: String,
    pub headers: Vec<String>,
    pub data: Vec<Row>,
    pub file_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOutcome {
    pub success: bool,
    pub table_name: String,
    pub row_count: u64,
    pub columns: Vec<String>,
}

pub struct UploadService {
    files: Arc<dyn FileCatalog>,
    tables: Arc<dyn TableStore>,
    objects: Arc<dyn ObjectStore>,
    policy: AccessPolicy,
}

impl UploadService {
    pub fn new(
        files: Arc<dyn FileCatalog>,
        tables: Arc<dyn TableStore>,
        objects: Arc<dyn ObjectStore>,
        policy: AccessPolicy,
    ) -> Self {
        Self { files, tables, objects, policy }
    }

    pub async fn register(&self, session: &Session, request: UploadRequest) -> Result<UploadOutcome> {
        if request.file_name.trim().is_empty() {
            return Err(AnalystError::Validation("File name is required".to_string()));
        }
        let (dataset, dropped_rows) = Dataset::from_csv_text(&request.csv_text)?;
        if dropped_rows > 0 {
            warn!("Dropped {} rows with the wrong number of fields", dropped_rows);
        }

        let table_name = generate_table_name();
        let object_path = format!("{}/{}.csv", session.user_id, table_name);
        self.objects.upload(&object_path, request.csv_text.as_bytes()).await?;

        let file = self
            .files
            .create(NewFile {
                owner_id: session.user_id.clone(),
                folder_id: request.folder_id,
                file_name: request.file_name,
                description: request.description,
                table_name,
                original_headers: dataset.headers.clone(),
                ai_summary: request.ai_summary,
            })
            .await?;

        info!("📄 Registered {} as {} ({} rows)", file.file_name, file.table_name, dataset.row_count());
        Ok(UploadOutcome {
            success: true,
            file,
            headers: dataset.headers,
            row_count: dataset.rows.len(),
            dropped_rows,
        })
    }

    pub async fn store(&self, session: &Session, request: StoreRequest) -> Result<StoreOutcome> {
        validate_table_name(&request.table_name)?;
        if request.headers.is_empty() {
            return Err(AnalystError::Validation("Headers are required".to_string()));
        }

        let file = self
            .files
            .find_owned(&session.user_id, request.file_id)
            .await?
            .filter(|f| f.table_name == request.table_name)
            .ok_or_else(|| AnalystError::NotFound("File not found".to_string()))?;
        if file.status != FileStatus::Pending {
            return Err(AnalystError::Validation(format!(
                "Table {} was already processed ({})",
                file.table_name, file.status
            )));
        }
        // Only the caller that wins the claim creates the table or compensates.
        if !self.files.claim_pending(file.id).await? {
            return Err(AnalystError::Validation(format!(
                "Table {} is already being stored",
                file.table_name
            )));
        }

        let columns = sanitize_headers(&request.headers);
        let rows: Vec<Vec<Option<String>>> = request.data.iter().map(|row| row_values(&request.headers, row)).collect();

        if let Err(e) = self.tables.create_text_table(&file.table_name, &columns, self.policy).await {
            error!("Creating {} failed: {}", file.table_name, e);
            self.mark_failed(file.id).await;
            return Err(e);
        }

        let inserted = match self
            .tables
            .insert_rows(&file.table_name, &session.user_id, &columns, &rows)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                error!("Inserting into {} failed, dropping the table: {}", file.table_name, e);
                if let Err(drop_err) = self.tables.drop_table(&file.table_name).await {
                    error!("Could not drop {}: {}", file.table_name, drop_err);
                }
                self.mark_failed(file.id).await;
                return Err(e);
            }
        };

        self.files.set_status(file.id, FileStatus::Ready, inserted as i64).await?;
        Ok(StoreOutcome {
            success: true,
            table_name: file.table_name,
            row_count: inserted,
            columns,
        })
    }

    async fn mark_failed(&self, id: Uuid) {
        if let Err(e) = self.files.set_status(id, FileStatus::Failed, 0).await {
            error!("Could not mark file {} as failed: {}", id, e);
        }
    }
}
