use crate::error::{AnalystError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One completion call: system prompt, conversation, sampling limits.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatTurn>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            max_tokens: 400,
            temperature: 0.2,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// LLM completion capability. Output is plain text; callers decide how to parse it.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Run a completion with a deadline; expiry becomes `AnalystError::Timeout`.
pub async fn complete_with_timeout(
    service: &dyn CompletionService,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, service.complete(request)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("LLM call exceeded {}s", timeout.as_secs());
            Err(AnalystError::Timeout(timeout.as_secs()))
        }
    }
}

/// Strip Markdown code fences (```json / ```) wrapped around model output.
pub fn clean_json_response(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        for turn in &request.messages {
            messages.push(serde_json::json!({
                "role": turn.role,
                "content": turn.content,
            }));
        }

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let body = self.request_body(&request);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalystError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AnalystError::Llm(format!("LLM API returned {}: {}", status, text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalystError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AnalystError::Llm("No content in LLM response".to_string()))?;

        debug!("LLM returned {} chars", content.len());
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_response_strips_fences() {
        let raw = "```json\n{\"sql\": null}\n```";
        assert_eq!(clean_json_response(raw), "{\"sql\": null}");
        assert_eq!(clean_json_response("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(clean_json_response("```\n[]\n```"), "[]");
    }

    #[test]
    fn test_request_body_shape() {
        let client = LlmClient::new("k".into(), "gpt-4o-mini".into(), "https://example.com/v1/".into());
        let request = CompletionRequest::new("sys", vec![ChatTurn::user("hi"), ChatTurn::assistant("yo")])
            .max_tokens(300)
            .temperature(0.0);
        let body = client.request_body(&request);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(client.base_url, "https://example.com/v1");
    }

    struct Slow;

    #[async_trait]
    impl CompletionService for Slow {
        async fn complete(&self, _request: CompletionRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let result = complete_with_timeout(
            &Slow,
            CompletionRequest::new("s", vec![]),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(AnalystError::Timeout(_))));
    }
}
