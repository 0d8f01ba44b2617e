//! Data carried between pipeline stages

use crate::config::PipelineOptions;
use crate::corpus::RagSnippetSet;
use crate::errors::{AppError, FailureKind, Result};
use crate::llm::{LlmError, LlmResponse};
use crate::tools::ToolName;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Longest question accepted by the pipeline, in characters
pub const MAX_QUESTION_CHARS: usize = 2000;

/// Verbosity policy applied at synthesis time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStyle {
    #[default]
    Detailed,
    Compact,
}

impl ResponseStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStyle::Detailed => "detailed",
            ResponseStyle::Compact => "compact",
        }
    }
}

impl fmt::Display for ResponseStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseStyle {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detailed" => Ok(ResponseStyle::Detailed),
            "compact" => Ok(ResponseStyle::Compact),
            other => Err(AppError::Validation {
                message: format!("unknown style '{}', expected 'detailed' or 'compact'", other),
                field: Some("style".into()),
            }),
        }
    }
}

/// One citizen question, immutable for the lifetime of a run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub original_question: String,
    /// Opaque caller reference, passed through to logs and the audit record
    pub session_context: Option<String>,
    pub style: ResponseStyle,
    /// Empty means the configured default allowlist
    pub trusted_domains: Vec<String>,
    /// Empty means `options.rag_domains`
    pub knowledge_domain_tags: Vec<String>,
    pub options: PipelineOptions,
}

impl PipelineRequest {
    pub fn new(question: impl Into<String>, style: ResponseStyle) -> Self {
        Self {
            original_question: question.into(),
            session_context: None,
            style,
            trusted_domains: Vec::new(),
            knowledge_domain_tags: Vec::new(),
            options: PipelineOptions::default(),
        }
    }

    pub fn with_trusted_domains(mut self, domains: Vec<String>) -> Self {
        self.trusted_domains = domains;
        self
    }

    pub fn with_knowledge_tags(mut self, tags: Vec<String>) -> Self {
        self.knowledge_domain_tags = tags;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_context = Some(session.into());
        self
    }

    /// Reject questions the pipeline cannot meaningfully run on
    pub fn validate(&self) -> Result<()> {
        let question = self.original_question.trim();
        if question.is_empty() {
            return Err(AppError::Validation {
                message: "question must not be empty".into(),
                field: Some("question".into()),
            });
        }
        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(AppError::Validation {
                message: format!("question exceeds {} characters", MAX_QUESTION_CHARS),
                field: Some("question".into()),
            });
        }
        Ok(())
    }
}

/// Outcome of one search tool invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub tool_name: ToolName,
    pub success: bool,
    pub content: Option<String>,
    /// Trusted search only
    pub selected_domains: BTreeSet<String>,
    pub cited_urls: Vec<String>,
    pub error: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(serialize_with = "serialize_ms")]
    pub latency: Duration,
}

impl SearchResult {
    pub fn succeeded(tool_name: ToolName, response: LlmResponse, latency: Duration) -> Self {
        Self {
            tool_name,
            success: true,
            content: Some(response.text),
            selected_domains: BTreeSet::new(),
            cited_urls: response.cited_urls,
            error: None,
            error_message: None,
            latency,
        }
    }

    pub fn failed(tool_name: ToolName, kind: FailureKind, message: impl Into<String>, latency: Duration) -> Self {
        Self {
            tool_name,
            success: false,
            content: None,
            selected_domains: BTreeSet::new(),
            cited_urls: Vec::new(),
            error: Some(kind),
            error_message: Some(message.into()),
            latency,
        }
    }

    pub fn from_error(tool_name: ToolName, err: &LlmError, latency: Duration) -> Self {
        Self::failed(tool_name, FailureKind::from(err), err.to_string(), latency)
    }

    pub fn timed_out(tool_name: ToolName, latency: Duration) -> Self {
        Self::failed(
            tool_name,
            FailureKind::Timeout,
            format!("{} did not finish before its deadline", tool_name),
            latency,
        )
    }

    pub fn disabled(tool_name: ToolName) -> Self {
        Self::failed(tool_name, FailureKind::Disabled, format!("{} is disabled", tool_name), Duration::ZERO)
    }

    pub fn with_selected_domains(mut self, domains: BTreeSet<String>) -> Self {
        self.selected_domains = domains;
        self
    }

    /// Whether the tool was actually invoked for this run
    pub fn attempted(&self) -> bool {
        self.error != Some(FailureKind::Disabled)
    }

    /// Content worth putting in front of the synthesizing model
    pub fn usable_content(&self) -> Option<&str> {
        if !self.success {
            return None;
        }
        self.content.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

/// Everything synthesis needs, assembled once retrieval has settled
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    pub run_id: Uuid,
    pub started_at: Instant,
    /// Date the prompts are anchored to
    pub as_of: NaiveDate,
    pub request: PipelineRequest,
    pub reformulated_query: String,
    /// False when reformulation degraded to the original question
    pub reformulation_applied: bool,
    pub regular: SearchResult,
    pub trusted: SearchResult,
    pub snippets: Vec<Arc<RagSnippetSet>>,
}

impl SynthesisInput {
    /// Snippets that will be shown to the model
    pub fn active_snippets(&self) -> impl Iterator<Item = &RagSnippetSet> {
        let enabled = self.request.options.use_rag_context;
        self.snippets
            .iter()
            .filter(move |s| enabled && !s.text_blob.trim().is_empty())
            .map(|s| s.as_ref())
    }

    /// True when at least one source contributes content
    pub fn has_usable_content(&self) -> bool {
        self.regular.usable_content().is_some()
            || self.trusted.usable_content().is_some()
            || self.active_snippets().next().is_some()
    }
}

/// Terminal artifact of a successful run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisResult {
    pub run_id: Uuid,
    pub final_text: String,
    pub style_used: ResponseStyle,
    /// Tools whose output reached the answer, in pipeline order
    pub tools_consulted: Vec<String>,
    /// No retrieval source contributed content
    pub degraded: bool,
    #[serde(serialize_with = "serialize_ms")]
    pub total_latency: Duration,
}

pub(crate) fn serialize_ms<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
