//! Query reformulation
//!
//! Rewrites the citizen's question into a search-friendly query with a single
//! LLM call. Every failure degrades to the original question.

use super::prompts::{reformulation_system_prompt, REFORMULATION_PROMPT_VERSION};
use super::trace::StageError;
use crate::errors::FailureKind;
use crate::llm::{CallStage, LlmError, LlmProvider, LlmRequest};
use crate::tools::ToolConfig;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one reformulation attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Reformulation {
    /// Query to use downstream; the original question when anything failed
    pub query: String,
    /// False when the tool was disabled and no call was made
    pub attempted: bool,
    pub prompt_version: &'static str,
    pub error: Option<StageError>,
}

impl Reformulation {
    fn unchanged(question: &str, attempted: bool, error: Option<StageError>) -> Self {
        Self {
            query: question.to_string(),
            attempted,
            prompt_version: REFORMULATION_PROMPT_VERSION,
            error,
        }
    }

    /// Whether the query came from the model rather than the fallback
    pub fn applied(&self) -> bool {
        self.attempted && self.error.is_none()
    }
}

pub struct QueryReformulator {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl QueryReformulator {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Reformulated query, or `question` unchanged on any failure
    pub async fn reformulate(&self, question: &str, as_of: NaiveDate, config: &ToolConfig) -> String {
        self.reformulate_detailed(question, as_of, config).await.query
    }

    pub async fn reformulate_detailed(&self, question: &str, as_of: NaiveDate, config: &ToolConfig) -> Reformulation {
        if !config.enabled {
            debug!("Reformulation disabled, using original question");
            return Reformulation::unchanged(question, false, None);
        }

        let request = LlmRequest::new(CallStage::Reformulation, &config.model, question)
            .with_system(reformulation_system_prompt(as_of))
            .with_sampling(config.temperature, config.max_tokens);

        let outcome = match tokio::time::timeout(self.timeout, self.provider.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        };

        match outcome.map(|response| clean_query(&response.text)) {
            Ok(query) if !query.is_empty() => {
                debug!(version = REFORMULATION_PROMPT_VERSION, "Question reformulated");
                Reformulation {
                    query,
                    attempted: true,
                    prompt_version: REFORMULATION_PROMPT_VERSION,
                    error: None,
                }
            }
            Ok(_) => {
                warn!("Reformulation returned no text, using original question");
                Reformulation::unchanged(
                    question,
                    true,
                    Some(StageError::new(FailureKind::EmptyResponse, "reformulation returned no text")),
                )
            }
            Err(e) => {
                warn!(error = %e, "Reformulation failed, using original question");
                Reformulation::unchanged(question, true, Some(StageError::from(&e)))
            }
        }
    }
}

/// First non-empty line, trimmed of whitespace and surrounding quotes
fn clean_query(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    line.trim_matches(|c: char| matches!(c, '"' | '\'' | '„' | '”' | '“' | '`'))
        .trim()
        .to_string()
}
