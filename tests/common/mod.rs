//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use csv_analyst::api::AppState;
use csv_analyst::classifier::ColumnClassifier;
use csv_analyst::config::EngineConfig;
use csv_analyst::dataset::Row;
use csv_analyst::error::{AnalystError, Result};
use csv_analyst::files::{FileCatalog, FileRecord, FileStatus, NewFile};
use csv_analyst::llm::{CompletionRequest, CompletionService};
use csv_analyst::preprocess::Preprocessor;
use csv_analyst::quality::QualityAnalyzer;
use csv_analyst::query_engine::ChatQueryEngine;
use csv_analyst::session::{IdentityProvider, Session};
use csv_analyst::storage::ObjectStore;
use csv_analyst::table_store::{AccessPolicy, ColumnSchema, SqlExecutor, TableStore};
use csv_analyst::upload::UploadService;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const TOKEN: &str = "token-u1";
pub const USER: &str = "u1";

/// Replies with queued responses in order and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_error(&self, err: AnalystError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AnalystError::Llm("no scripted reply".into())))
    }
}

/// Fixed schema and sample; `execute_as` pops queued results.
pub struct MemoryExecutor {
    pub columns: Vec<ColumnSchema>,
    pub sample: Vec<Row>,
    pub total: u64,
    /// Added to `describe_columns`, for deadline tests.
    pub delay: Option<Duration>,
    results: Mutex<VecDeque<Result<Vec<Row>>>>,
    pub executed: Mutex<Vec<(String, String)>>,
}

impl MemoryExecutor {
    pub fn new(data_columns: &[&str]) -> Self {
        let mut columns = vec![
            column("id", "bigint"),
            column("created_at", "timestamp with time zone"),
            column("owner_id", "text"),
        ];
        columns.extend(data_columns.iter().map(|c| column(c, "text")));
        Self {
            columns,
            sample: Vec::new(),
            total: 0,
            delay: None,
            results: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn push_rows(&self, rows: Vec<Value>) {
        let rows = rows.into_iter().filter_map(|v| v.as_object().cloned()).collect();
        self.results.lock().unwrap().push_back(Ok(rows));
    }

    pub fn push_error(&self, err: AnalystError) {
        self.results.lock().unwrap().push_back(Err(err));
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().unwrap().iter().map(|(_, sql)| sql.clone()).collect()
    }
}

pub fn column(name: &str, data_type: &str) -> ColumnSchema {
    ColumnSchema { name: name.to_string(), data_type: data_type.to_string(), is_nullable: true }
}

#[async_trait]
impl SqlExecutor for MemoryExecutor {
    async fn execute_as(&self, user_id: &str, sql: &str) -> Result<Vec<Row>> {
        self.executed.lock().unwrap().push((user_id.to_string(), sql.to_string()));
        self.results.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn describe_columns(&self, _table: &str) -> Result<Vec<ColumnSchema>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.columns.clone())
    }

    async fn count_rows(&self, _user_id: &str, _relation: &str) -> Result<u64> {
        Ok(self.total)
    }

    async fn sample_rows(&self, _user_id: &str, _relation: &str, limit: usize) -> Result<Vec<Row>> {
        Ok(self.sample.iter().take(limit).cloned().collect())
    }
}

pub struct StoredTable {
    pub columns: Vec<String>,
    pub policy: AccessPolicy,
    pub rows: Vec<(String, Vec<Option<String>>)>,
}

#[derive(Default)]
pub struct MemoryTables {
    pub tables: Mutex<HashMap<String, StoredTable>>,
    pub fail_insert: bool,
}

#[async_trait]
impl TableStore for MemoryTables {
    async fn create_text_table(&self, name: &str, columns: &[String], policy: AccessPolicy) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(name) {
            return Err(AnalystError::Execution(format!("relation \"{}\" already exists", name)));
        }
        tables.insert(name.to_string(), StoredTable { columns: columns.to_vec(), policy, rows: Vec::new() });
        Ok(())
    }

    async fn insert_rows(
        &self,
        name: &str,
        owner_id: &str,
        _columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64> {
        if self.fail_insert {
            return Err(AnalystError::Execution("insert failed".into()));
        }
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| AnalystError::NotFound(name.to_string()))?;
        table
            .rows
            .extend(rows.iter().map(|r| (owner_id.to_string(), r.clone())));
        Ok(rows.len() as u64)
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        self.tables.lock().unwrap().remove(name);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFiles {
    pub records: Mutex<Vec<FileRecord>>,
    /// Yield after each owned lookup so concurrent callers interleave.
    pub yield_after_lookup: bool,
}

impl MemoryFiles {
    /// Insert a ready file for `owner` backed by `table`.
    pub fn seed(&self, owner: &str, table: &str) -> FileRecord {
        let mut record = NewFile {
            owner_id: owner.to_string(),
            folder_id: Some("f1".to_string()),
            file_name: "sales.csv".to_string(),
            description: "Monthly sales".to_string(),
            table_name: table.to_string(),
            original_headers: vec!["Name".to_string(), "Amount".to_string()],
            ai_summary: None,
        }
        .into_record();
        record.status = FileStatus::Ready;
        self.records.lock().unwrap().push(record.clone());
        record
    }

    pub fn get(&self, id: Uuid) -> Option<FileRecord> {
        self.records.lock().unwrap().iter().find(|f| f.id == id).cloned()
    }
}

#[async_trait]
impl FileCatalog for MemoryFiles {
    async fn create(&self, file: NewFile) -> Result<FileRecord> {
        let record = file.into_record();
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn find_owned(&self, owner_id: &str, id: Uuid) -> Result<Option<FileRecord>> {
        let found = self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.id == id && f.owner_id == owner_id)
            .cloned();
        if self.yield_after_lookup {
            tokio::task::yield_now().await;
        }
        Ok(found)
    }

    async fn find_by_table(&self, owner_id: &str, table_name: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.table_name == table_name && f.owner_id == owner_id)
            .cloned())
    }

    async fn list_folder(&self, owner_id: &str, folder_id: Option<&str>) -> Result<Vec<FileRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.owner_id == owner_id)
            .filter(|f| folder_id.map_or(true, |id| f.folder_id.as_deref() == Some(id)))
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: Uuid, status: FileStatus, row_count: i64) -> Result<()> {
        if let Some(record) = self.records.lock().unwrap().iter_mut().find(|f| f.id == id) {
            record.status = status;
            record.row_count = row_count;
        }
        Ok(())
    }

    async fn claim_pending(&self, id: Uuid) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|f| f.id == id && f.status == FileStatus::Pending) {
            Some(record) => {
                record.status = FileStatus::Storing;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, owner_id: &str, id: Uuid) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|f| !(f.id == id && f.owner_id == owner_id));
        Ok(records.len() < before)
    }
}

pub struct StaticIdentity {
    sessions: HashMap<String, Session>,
}

impl Default for StaticIdentity {
    fn default() -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(TOKEN.to_string(), session(USER));
        sessions.insert("token-u2".to_string(), session("u2"));
        Self { sessions }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve(&self, token: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(token).cloned())
    }
}

#[derive(Default)]
pub struct MemoryObjects {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.objects.lock().unwrap().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

pub fn session(user_id: &str) -> Session {
    Session { user_id: user_id.to_string(), email: Some(format!("{}@example.com", user_id)) }
}

/// Engine settings with intent routing off, so scripted replies map 1:1 to turn steps.
pub fn engine_config() -> EngineConfig {
    EngineConfig { intent_classification: false, ..EngineConfig::default() }
}

pub struct Harness {
    pub llm: Arc<ScriptedLlm>,
    pub executor: Arc<MemoryExecutor>,
    pub files: Arc<MemoryFiles>,
    pub tables: Arc<MemoryTables>,
    pub objects: Arc<MemoryObjects>,
}

impl Harness {
    pub fn new(llm: ScriptedLlm, executor: MemoryExecutor) -> Self {
        Self::with_tables(llm, executor, MemoryTables::default())
    }

    pub fn with_tables(llm: ScriptedLlm, executor: MemoryExecutor, tables: MemoryTables) -> Self {
        Self::with_files(llm, executor, tables, MemoryFiles::default())
    }

    pub fn with_files(llm: ScriptedLlm, executor: MemoryExecutor, tables: MemoryTables, files: MemoryFiles) -> Self {
        Self {
            llm: Arc::new(llm),
            executor: Arc::new(executor),
            files: Arc::new(files),
            tables: Arc::new(tables),
            objects: Arc::new(MemoryObjects::default()),
        }
    }

    pub fn engine(&self, config: EngineConfig) -> ChatQueryEngine {
        ChatQueryEngine::new(self.llm.clone(), self.executor.clone(), self.files.clone(), config)
    }

    pub fn uploads(&self) -> UploadService {
        UploadService::new(self.files.clone(), self.tables.clone(), self.objects.clone(), AccessPolicy::OwnerScoped)
    }

    pub fn state(&self) -> AppState {
        self.state_with(engine_config())
    }

    pub fn state_with(&self, config: EngineConfig) -> AppState {
        let analyzer = QualityAnalyzer::default();
        AppState {
            engine: Arc::new(self.engine(config)),
            uploads: Arc::new(self.uploads()),
            classifier: Arc::new(ColumnClassifier::new(self.llm.clone(), Duration::from_secs(5))),
            preprocessor: Arc::new(Preprocessor::new(analyzer.clone())),
            analyzer,
            identity: Arc::new(StaticIdentity::default()),
            files: self.files.clone(),
            executor: self.executor.clone(),
            tables: self.tables.clone(),
        }
    }
}
