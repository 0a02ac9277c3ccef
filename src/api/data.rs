//! Paginated reads of a stored table.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::{authenticate, present, ApiResult, AppState};
use crate::dataset::Row;
use crate::error::AnalystError;
use crate::table_store::{quote_ident, validate_table_name, with_deadline};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

pub fn router() -> Router<AppState> {
    Router::new().route("/csv-data", get(csv_data))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvDataParams {
    pub table_name: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvDataResponse {
    pub data: Vec<Row>,
    pub columns: Vec<String>,
    pub pagination: Pagination,
}

fn parse_bound(raw: Option<String>, name: &str, default: u32, max: u32) -> Result<u32, AnalystError> {
    let Some(raw) = present(raw) else { return Ok(default) };
    match raw.trim().parse::<u32>() {
        Ok(n) if (1..=max).contains(&n) => Ok(n),
        _ => Err(AnalystError::Validation(format!("{} must be between 1 and {}", name, max))),
    }
}

async fn csv_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CsvDataParams>,
) -> ApiResult<CsvDataResponse> {
    let table = present(params.table_name)
        .ok_or_else(|| AnalystError::Validation("Table name is required".to_string()))?;
    let page = parse_bound(params.page, "page", 1, u32::MAX)?;
    let limit = parse_bound(params.limit, "limit", DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE)?;
    validate_table_name(&table)?;

    let session = authenticate(&state, &headers).await?;
    state
        .files
        .find_by_table(&session.user_id, &table)
        .await?
        .ok_or_else(|| AnalystError::NotFound("File not found".to_string()))?;

    let deadline = state.engine.sql_timeout();
    let columns: Vec<String> = with_deadline(deadline, state.executor.describe_columns(&table))
        .await?
        .into_iter()
        .filter(|c| !c.is_system())
        .map(|c| c.name)
        .collect();
    let total = with_deadline(deadline, state.executor.count_rows(&session.user_id, &quote_ident(&table))).await?;
    let data = with_deadline(
        deadline,
        state.executor.fetch_page(&session.user_id, &table, &columns, page, limit),
    )
    .await?;

    Ok(Json(CsvDataResponse {
        data,
        columns,
        pagination: Pagination {
            page,
            limit,
            total,
            total_pages: total.div_ceil(u64::from(limit)),
        },
    }))
}
