//! Upload, classification and preprocessing endpoints.

use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::api::{authenticate, present, ApiResult, AppState};
use crate::classifier::ColumnClassification;
use crate::dataset::{Dataset, Row};
use crate::error::AnalystError;
use crate::preprocess::{PreprocessOptions, PreprocessOutcome};
use crate::quality::DataQualitySummary;
use crate::upload::{StoreOutcome, StoreRequest, UploadOutcome, UploadRequest};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload-csv", post(upload_csv))
        .route("/store-csv", post(store_csv))
        .route("/generate-summary", post(generate_summary))
        .route("/preprocess", post(preprocess))
        .route("/data-quality", post(data_quality))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBody {
    pub file_name: Option<String>,
    pub description: Option<String>,
    pub csv_text: Option<String>,
    pub folder_id: Option<String>,
    pub ai_summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreBody {
    pub table_name: Option<String>,
    pub headers: Option<Vec<String>>,
    pub data: Option<Vec<Row>>,
    pub file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetBody {
    pub headers: Option<Vec<String>>,
    pub rows: Option<Vec<Row>>,
    #[serde(default)]
    pub preprocessing_steps: Vec<String>,
    #[serde(flatten)]
    pub options: PreprocessOptions,
}

impl DatasetBody {
    fn dataset(&mut self) -> Result<Dataset, AnalystError> {
        match (self.headers.take(), self.rows.take()) {
            (Some(headers), Some(rows)) if !headers.is_empty() => {
                let mut dataset = Dataset::new(headers.clone(), rows);
                // Every row gets a value for every header.
                dataset.project(headers);
                Ok(dataset)
            }
            _ => Err(AnalystError::Validation("Missing headers or rows".to_string())),
        }
    }
}

async fn upload_csv(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UploadBody>,
) -> ApiResult<UploadOutcome> {
    let csv_text = present(body.csv_text)
        .ok_or_else(|| AnalystError::Validation("CSV content is empty".to_string()))?;
    let file_name = present(body.file_name)
        .ok_or_else(|| AnalystError::Validation("File name is required".to_string()))?;

    let session = authenticate(&state, &headers).await?;

    let request = UploadRequest {
        file_name,
        description: body.description.unwrap_or_default(),
        csv_text,
        folder_id: present(body.folder_id),
        ai_summary: present(body.ai_summary),
    };
    Ok(Json(state.uploads.register(&session, request).await?))
}

async fn store_csv(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StoreBody>,
) -> ApiResult<StoreOutcome> {
    let (Some(table_name), Some(columns), Some(data), Some(file_id)) =
        (present(body.table_name), body.headers, body.data, present(body.file_id))
    else {
        return Err(AnalystError::Validation("Missing required fields".to_string()).into());
    };

    let session = authenticate(&state, &headers).await?;

    let file_id = Uuid::parse_str(file_id.trim())
        .map_err(|_| AnalystError::NotFound("File not found".to_string()))?;
    let request = StoreRequest { table_name, headers: columns, data, file_id };
    Ok(Json(state.uploads.store(&session, request).await?))
}

async fn generate_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<DatasetBody>,
) -> ApiResult<ColumnClassification> {
    let dataset = body.dataset()?;
    authenticate(&state, &headers).await?;

    let classification = match state
        .classifier
        .classify(&dataset.headers, &dataset.rows, &body.preprocessing_steps)
        .await
    {
        Ok(classification) => classification,
        Err(e) => {
            warn!("Column classification unavailable: {}", e);
            ColumnClassification::fallback("Failed to generate AI summary".to_string(), &dataset.headers)
        }
    };
    Ok(Json(classification))
}

async fn preprocess(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<DatasetBody>,
) -> ApiResult<PreprocessOutcome> {
    let dataset = body.dataset()?;
    authenticate(&state, &headers).await?;
    Ok(Json(state.preprocessor.run(dataset, &body.options)))
}

async fn data_quality(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<DatasetBody>,
) -> ApiResult<DataQualitySummary> {
    let dataset = body.dataset()?;
    authenticate(&state, &headers).await?;
    Ok(Json(state.analyzer.analyze(&dataset.headers, &dataset.rows)))
}
