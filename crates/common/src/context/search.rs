//! Search orchestration
//!
//! Runs the open web search and the allowlisted trusted search concurrently.
//! Each branch has its own timeout and retry budget, and a failure in one
//! never cancels the other.

use super::prompts::{domain_selection_prompt, DOMAIN_SELECTION_SYSTEM, REGULAR_SEARCH_SYSTEM, TRUSTED_SEARCH_SYSTEM};
use super::types::SearchResult;
use crate::errors::FailureKind;
use crate::llm::{complete_with_retry, CallStage, LlmProvider, LlmRequest, ResponseFormat, RetryPolicy};
use crate::tools::{ToolConfig, ToolName};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on the domain-selection answer
const SELECTION_MAX_TOKENS: u32 = 200;

/// Per-branch settings, taken from the run's config snapshot
#[derive(Debug, Clone)]
pub struct SearchConfigs {
    pub regular: ToolConfig,
    pub trusted: ToolConfig,
}

#[derive(Debug, Deserialize)]
struct DomainSelection {
    #[serde(default)]
    domains: Vec<String>,
}

/// Reduce a domain or URL to its bare lowercase host
pub fn normalize_domain(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let host = without_scheme.split(['/', '?', '#']).next().unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(host).trim_end_matches('.').to_string()
}

/// Parse the selection answer and keep only allowlisted domains
fn parse_selection(text: &str, allowlist: &BTreeSet<String>) -> BTreeSet<String> {
    let body = text.trim().trim_start_matches("```json").trim_matches('`').trim();
    match serde_json::from_str::<DomainSelection>(body) {
        Ok(selection) => selection
            .domains
            .iter()
            .map(|d| normalize_domain(d))
            .filter(|d| allowlist.contains(d))
            .collect(),
        Err(e) => {
            debug!(error = %e, "Domain selection was not valid JSON");
            BTreeSet::new()
        }
    }
}

pub struct SearchOrchestrator {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    branch_timeout: Duration,
}

impl SearchOrchestrator {
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy, branch_timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            branch_timeout,
        }
    }

    /// Run both branches, each bounded only by its own timeout
    pub async fn search(
        &self,
        query: &str,
        trusted_domains: &BTreeSet<String>,
        configs: &SearchConfigs,
    ) -> (SearchResult, SearchResult) {
        self.search_until(query, trusted_domains, configs, None).await
    }

    /// Run both branches; each stops at its own timeout or `deadline`,
    /// whichever comes first
    pub async fn search_until(
        &self,
        query: &str,
        trusted_domains: &BTreeSet<String>,
        configs: &SearchConfigs,
        deadline: Option<Instant>,
    ) -> (SearchResult, SearchResult) {
        let now = Instant::now();
        let branch_deadline = match deadline {
            Some(deadline) => deadline.min(now + self.branch_timeout),
            None => now + self.branch_timeout,
        };

        let regular = self.bounded(
            ToolName::RegularSearch,
            &configs.regular,
            branch_deadline,
            self.regular(query, &configs.regular),
        );
        let trusted = self.bounded(
            ToolName::TrustedSearch,
            &configs.trusted,
            branch_deadline,
            self.trusted(query, trusted_domains, &configs.trusted),
        );

        let (regular, trusted) = tokio::join!(regular, trusted);
        info!(
            regular_ok = regular.success,
            trusted_ok = trusted.success,
            selected = trusted.selected_domains.len(),
            "Search branches settled"
        );
        (regular, trusted)
    }

    async fn bounded<F>(&self, tool: ToolName, config: &ToolConfig, deadline: Instant, branch: F) -> SearchResult
    where
        F: Future<Output = SearchResult>,
    {
        if !config.enabled {
            debug!(tool = %tool, "Search branch disabled");
            return SearchResult::disabled(tool);
        }

        let started = Instant::now();
        match tokio::time::timeout_at(deadline, branch).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tool = %tool, "Search branch timed out");
                SearchResult::timed_out(tool, started.elapsed())
            }
        }
    }

    async fn regular(&self, query: &str, config: &ToolConfig) -> SearchResult {
        let started = Instant::now();
        let request = LlmRequest::new(CallStage::RegularSearch, &config.model, query)
            .with_system(REGULAR_SEARCH_SYSTEM)
            .with_sampling(config.temperature, config.max_tokens)
            .with_web_search(Vec::new());

        match complete_with_retry(self.provider.as_ref(), &request, &self.policy).await {
            Ok(response) => SearchResult::succeeded(ToolName::RegularSearch, response, started.elapsed()),
            Err(e) => {
                warn!(error = %e, "Regular search failed");
                SearchResult::from_error(ToolName::RegularSearch, &e, started.elapsed())
            }
        }
    }

    async fn trusted(&self, query: &str, trusted_domains: &BTreeSet<String>, config: &ToolConfig) -> SearchResult {
        let started = Instant::now();
        let allowlist: BTreeSet<String> = trusted_domains
            .iter()
            .map(|d| normalize_domain(d))
            .filter(|d| !d.is_empty())
            .collect();

        if allowlist.is_empty() {
            return SearchResult::failed(
                ToolName::TrustedSearch,
                FailureKind::PermanentProvider,
                "no trusted domains configured",
                started.elapsed(),
            );
        }

        let selected = self.select_domains(query, &allowlist, config).await;
        let request = LlmRequest::new(CallStage::TrustedSearch, &config.model, query)
            .with_system(TRUSTED_SEARCH_SYSTEM)
            .with_sampling(config.temperature, config.max_tokens)
            .with_web_search(selected.iter().cloned().collect());

        let result = match complete_with_retry(self.provider.as_ref(), &request, &self.policy).await {
            Ok(response) => SearchResult::succeeded(ToolName::TrustedSearch, response, started.elapsed()),
            Err(e) => {
                warn!(error = %e, "Trusted search failed");
                SearchResult::from_error(ToolName::TrustedSearch, &e, started.elapsed())
            }
        };
        result.with_selected_domains(selected)
    }

    /// Ask the model which allowlisted domains fit the query; the full
    /// allowlist when it cannot say
    async fn select_domains(&self, query: &str, allowlist: &BTreeSet<String>, config: &ToolConfig) -> BTreeSet<String> {
        let domains: Vec<&str> = allowlist.iter().map(String::as_str).collect();
        let request = LlmRequest::new(
            CallStage::DomainSelection,
            &config.model,
            domain_selection_prompt(query, &domains),
        )
        .with_system(DOMAIN_SELECTION_SYSTEM)
        .with_sampling(0.0, config.max_tokens.min(SELECTION_MAX_TOKENS))
        .with_response_format(ResponseFormat::JsonObject);

        let selected = match complete_with_retry(self.provider.as_ref(), &request, &self.policy).await {
            Ok(response) => parse_selection(&response.text, allowlist),
            Err(e) => {
                warn!(error = %e, "Domain selection failed, using full allowlist");
                BTreeSet::new()
            }
        };

        if selected.is_empty() {
            allowlist.clone()
        } else {
            debug!(?selected, "Trusted domains selected");
            selected
        }
    }
}
