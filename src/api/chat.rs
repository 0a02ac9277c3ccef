//! Chat query endpoint.

use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::{authenticate, present, ApiResult, AppState};
use crate::error::AnalystError;
use crate::llm::{ChatTurn, Role};
use crate::query_engine::{ChatQuery, ChatResponse};

pub fn router() -> Router<AppState> {
    Router::new().route("/chat-query", post(chat_query))
}

/// Body of `POST /chat-query`. Fields are optional here so that a missing
/// one is a 400 with a clear message rather than a rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQueryBody {
    pub message: Option<String>,
    pub file_id: Option<String>,
    pub table_name: Option<String>,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

/// A previous chat message as the client keeps it; extra fields are ignored.
#[derive(Debug, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl HistoryMessage {
    fn into_turn(self) -> Option<ChatTurn> {
        let role = match self.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => return None,
        };
        Some(ChatTurn { role, content: self.content.unwrap_or_default() })
    }
}

async fn chat_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatQueryBody>,
) -> ApiResult<ChatResponse> {
    let (Some(message), Some(file_id), Some(table_name)) =
        (present(body.message), present(body.file_id), present(body.table_name))
    else {
        return Err(AnalystError::Validation("Missing required fields".to_string()).into());
    };

    let session = authenticate(&state, &headers).await?;

    let file_id = Uuid::parse_str(file_id.trim())
        .map_err(|_| AnalystError::NotFound("File not found".to_string()))?;
    let history = body.messages.into_iter().filter_map(HistoryMessage::into_turn).collect();

    let response = state
        .engine
        .handle_turn(&session, ChatQuery { message, file_id, table_name, history })
        .await?;
    Ok(Json(response))
}
