//! HTTP API endpoints.
//!
//! Handlers validate their input first, then resolve the caller's session,
//! then call into the engine. Errors map to status codes in one place.

pub mod chat;
pub mod data;
pub mod files;
pub mod health;
pub mod upload;

use crate::classifier::ColumnClassifier;
use crate::error::AnalystError;
use crate::files::FileCatalog;
use crate::preprocess::Preprocessor;
use crate::quality::QualityAnalyzer;
use crate::query_engine::ChatQueryEngine;
use crate::session::{bearer_token, IdentityProvider, Session};
use crate::table_store::{SqlExecutor, TableStore};
use crate::upload::UploadService;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Shared handles for every request.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatQueryEngine>,
    pub uploads: Arc<UploadService>,
    pub classifier: Arc<ColumnClassifier>,
    pub preprocessor: Arc<Preprocessor>,
    pub analyzer: QualityAnalyzer,
    pub identity: Arc<dyn IdentityProvider>,
    pub files: Arc<dyn FileCatalog>,
    pub executor: Arc<dyn SqlExecutor>,
    pub tables: Arc<dyn TableStore>,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(chat::router())
        .merge(upload::router())
        .merge(data::router())
        .merge(files::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError(pub AnalystError);

impl From<AnalystError> for ApiError {
    fn from(err: AnalystError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            AnalystError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AnalystError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AnalystError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            other => {
                error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Resolve the bearer token to a session or fail with 401.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| AnalystError::Unauthorized("missing bearer token".to_string()))?;

    state
        .identity
        .resolve(token)
        .await?
        .ok_or_else(|| AnalystError::Unauthorized("unknown or expired session".to_string()).into())
}

/// `Some` only for a value with non-whitespace content.
pub(crate) fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
