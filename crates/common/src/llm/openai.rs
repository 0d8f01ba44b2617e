//! OpenAI-compatible provider
//!
//! Plain calls go to `/chat/completions`; calls carrying a `WebSearch` scope
//! go to `/responses` with the `web_search` tool, restricted to the allowed
//! domains when any are given.

use super::{LlmError, LlmProvider, LlmRequest, LlmResponse, ResponseFormat};
use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

impl OpenAiProvider {
    /// Create a new provider; a missing or blank API key is accepted here and
    /// reported as `MissingCredentials` on every call.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        Ok(Self {
            client,
            api_key,
            base_url: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn chat(&self, api_key: &str, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: match request.response_format {
                Some(ResponseFormat::JsonObject) => Some(json!({ "type": "json_object" })),
                _ => None,
            },
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Serialization(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(LlmResponse::text(text))
    }

    async fn web_search(&self, api_key: &str, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
        let mut tool = json!({ "type": "web_search" });
        if let Some(scope) = &request.web_search {
            if !scope.allowed_domains.is_empty() {
                tool["filters"] = json!({ "allowed_domains": scope.allowed_domains });
            }
        }

        let mut body = json!({
            "model": request.model,
            "input": request.prompt,
            "tools": [tool],
            "max_output_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if !request.system.is_empty() {
            body["instructions"] = json!(request.system);
        }

        let url = format!("{}/responses", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Serialization(e.to_string()))?;

        Ok(parse_responses_output(&value))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingCredentials)?;

        debug!(
            stage = %request.stage,
            model = %request.model,
            max_tokens = request.max_tokens,
            web_search = request.web_search.is_some(),
            "Calling provider"
        );

        let response = if request.web_search.is_some() {
            self.web_search(api_key, request).await?
        } else {
            self.chat(api_key, request).await?
        };

        if response.text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

fn map_transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else if err.is_builder() {
        LlmError::InvalidRequest(err.to_string())
    } else {
        LlmError::Network(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> std::result::Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(classify_status(status, retry_after, body))
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, body: String) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Authentication(body),
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => LlmError::Timeout,
        s if s.is_client_error() => LlmError::InvalidRequest(format!("{}: {}", s.as_u16(), body)),
        s => LlmError::Api {
            status: s.as_u16(),
            message: body,
        },
    }
}

/// Collect `output_text` parts and `url_citation` annotations from a
/// responses-API payload.
fn parse_responses_output(value: &Value) -> LlmResponse {
    let mut text = String::new();
    let mut cited_urls: Vec<String> = Vec::new();

    let items = value
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let parts = item
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for part in parts {
            if part.get("type").and_then(Value::as_str) != Some("output_text") {
                continue;
            }
            if let Some(t) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(t);
            }
            let annotations = part
                .get("annotations")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for ann in annotations {
                if let Some(url) = ann.get("url").and_then(Value::as_str) {
                    if !cited_urls.iter().any(|u| u == url) {
                        cited_urls.push(url.to_string());
                    }
                }
            }
        }
    }

    LlmResponse { text, cited_urls }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CallStage;

    #[test]
    fn test_parse_responses_output() {
        let payload = json!({
            "output": [
                { "type": "web_search_call", "status": "completed" },
                {
                    "type": "message",
                    "content": [{
                        "type": "output_text",
                        "text": "Impozitul se plătește la DFMT.",
                        "annotations": [
                            { "type": "url_citation", "url": "https://dfmt.ro/taxe" },
                            { "type": "url_citation", "url": "https://dfmt.ro/taxe" }
                        ]
                    }]
                }
            ]
        });

        let parsed = parse_responses_output(&payload);
        assert_eq!(parsed.text, "Impozitul se plătește la DFMT.");
        assert_eq!(parsed.cited_urls, vec!["https://dfmt.ro/taxe".to_string()]);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3), String::new()),
            LlmError::RateLimited { retry_after: Some(3) }
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "nope".into()),
            LlmError::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "bad".into()),
            LlmError::InvalidRequest(_)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, String::new()).is_transient());
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_network() {
        let provider = OpenAiProvider::new(&LlmConfig {
            api_key: Some("   ".into()),
            ..LlmConfig::default()
        })
        .unwrap();

        let request = LlmRequest::new(CallStage::Reformulation, "gpt-4o-mini", "hello");
        let err = provider.complete(&request).await.unwrap_err();
        assert_eq!(err, LlmError::MissingCredentials);
    }
}
