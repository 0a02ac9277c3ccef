//! File metadata records
//!
//! A file record owns exactly one stored table and remembers where the
//! upload came from: folder, description, original headers, AI summary.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Registered, table not written yet.
    Pending,
    /// Claimed by one store call; its table is being written.
    Storing,
    Ready,
    /// Table creation or insertion failed and was compensated.
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Storing => "storing",
            FileStatus::Ready => "ready",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "storing" => Ok(FileStatus::Storing),
            "ready" => Ok(FileStatus::Ready),
            "failed" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub folder_id: Option<String>,
    pub file_name: String,
    pub description: String,
    pub table_name: String,
    pub original_headers: Vec<String>,
    pub ai_summary: Option<String>,
    pub status: FileStatus,
    pub row_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFile {
    pub owner_id: String,
    pub folder_id: Option<String>,
    pub file_name: String,
    pub description: String,
    pub table_name: String,
    pub original_headers: Vec<String>,
    pub ai_summary: Option<String>,
}

impl NewFile {
    pub fn into_record(self) -> FileRecord {
        FileRecord {
            id: Uuid::new_v4(),
            owner_id: self.owner_id,
            folder_id: self.folder_id,
            file_name: self.file_name,
            description: self.description,
            table_name: self.table_name,
            original_headers: self.original_headers,
            ai_summary: self.ai_summary,
            status: FileStatus::Pending,
            row_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Persistence for file records. Every lookup is scoped to an owner.
#[async_trait]
pub trait FileCatalog: Send + Sync {
    async fn create(&self, file: NewFile) -> Result<FileRecord>;

    async fn find_owned(&self, owner_id: &str, id: Uuid) -> Result<Option<FileRecord>>;

    async fn find_by_table(&self, owner_id: &str, table_name: &str) -> Result<Option<FileRecord>>;

    /// Files of `owner_id`; `None` lists every folder.
    async fn list_folder(&self, owner_id: &str, folder_id: Option<&str>) -> Result<Vec<FileRecord>>;

    async fn set_status(&self, id: Uuid, status: FileStatus, row_count: i64) -> Result<()>;

    /// Atomically move a `pending` record to `storing`. Returns false when
    /// another caller got there first or the record is no longer pending.
    async fn claim_pending(&self, id: Uuid) -> Result<bool>;

    /// Returns whether a record was removed.
    async fn delete(&self, owner_id: &str, id: Uuid) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [FileStatus::Pending, FileStatus::Storing, FileStatus::Ready, FileStatus::Failed] {
            assert_eq!(status.as_str().parse::<FileStatus>(), Ok(status));
        }
        assert!("done".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_new_file_starts_pending() {
        let record = NewFile {
            owner_id: "u1".into(),
            folder_id: None,
            file_name: "sales.csv".into(),
            description: String::new(),
            table_name: "csv_1_abc".into(),
            original_headers: vec!["Name".into()],
            ai_summary: None,
        }
        .into_record();
        assert_eq!(record.status, FileStatus::Pending);
        assert_eq!(record.row_count, 0);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tableName"], "csv_1_abc");
        assert_eq!(json["status"], "pending");
    }
}
