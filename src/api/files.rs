//! File listing and deletion.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::{authenticate, present, ApiResult, AppState};
use crate::error::AnalystError;
use crate::files::FileRecord;
use crate::table_store::with_deadline;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/files", get(list_files))
        .route("/files/{id}", delete(delete_file))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub folder_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
}

async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<FileRecord>> {
    let session = authenticate(&state, &headers).await?;
    let folder = present(params.folder_id);
    let files = state.files.list_folder(&session.user_id, folder.as_deref()).await?;
    Ok(Json(files))
}

/// Drops the file's table, then its record.
async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<DeleteResponse> {
    let session = authenticate(&state, &headers).await?;
    let not_found = || AnalystError::NotFound("File not found".to_string());

    let id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let file = state.files.find_owned(&session.user_id, id).await?.ok_or_else(not_found)?;

    with_deadline(state.engine.sql_timeout(), state.tables.drop_table(&file.table_name)).await?;
    state.files.delete(&session.user_id, id).await?;
    info!("🗑️ Deleted file {} and table {}", file.id, file.table_name);

    Ok(Json(DeleteResponse { success: true }))
}
