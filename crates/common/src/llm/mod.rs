//! LLM provider abstraction
//!
//! Every external model call in the pipeline goes through `LlmProvider`:
//! - `OpenAiProvider` talks to an OpenAI-compatible API (chat completions for
//!   plain calls, the responses API with the `web_search` tool for retrieval)
//! - `MockProvider` replays scripted behavior per call stage for tests

mod mock;
mod openai;
mod retry;

pub use mock::{Behavior, MockProvider};
pub use openai::OpenAiProvider;
pub use retry::{complete_with_retry, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which pipeline step issued a provider call. Used for logging, metrics
/// labels and mock routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStage {
    Reformulation,
    RegularSearch,
    DomainSelection,
    TrustedSearch,
    Synthesis,
}

impl CallStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStage::Reformulation => "reformulation",
            CallStage::RegularSearch => "regular_search",
            CallStage::DomainSelection => "domain_selection",
            CallStage::TrustedSearch => "trusted_search",
            CallStage::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for CallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format hint passed to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

/// Scope of a web-search-backed call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSearch {
    /// Empty means unrestricted
    pub allowed_domains: Vec<String>,
}

/// A single provider call
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub stage: CallStage,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system: String,
    pub prompt: String,
    pub response_format: Option<ResponseFormat>,
    pub web_search: Option<WebSearch>,
}

impl LlmRequest {
    pub fn new(stage: CallStage, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stage,
            model: model.into(),
            temperature: 0.0,
            max_tokens: 512,
            system: String::new(),
            prompt: prompt.into(),
            response_format: None,
            web_search: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_web_search(mut self, allowed_domains: Vec<String>) -> Self {
        self.web_search = Some(WebSearch { allowed_domains });
        self
    }
}

/// Provider answer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlmResponse {
    pub text: String,
    /// URLs the provider attached as citations (web search calls only)
    pub cited_urls: Vec<String>,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cited_urls: Vec::new(),
        }
    }
}

/// Typed provider failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("Provider credentials are not configured")]
    MissingCredentials,

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    #[error("Timeout")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LlmError {
    /// Whether the call may succeed if repeated
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout | LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status == 408 || *status >= 500,
            _ => false,
        }
    }
}

/// Trait for LLM/search providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Issue one call, no retries
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Provider name for logs
    fn name(&self) -> &str;
}
