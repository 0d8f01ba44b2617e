//! Response synthesis
//!
//! Merges whatever retrieval produced into one labeled prompt and asks the
//! synthesis model for the final answer. The style decides the template, the
//! token budget and the post-processing applied to the model's text.

use super::prompts::{synthesis_system_prompt, SYNTHESIS_PROMPT_VERSION};
use super::search::normalize_domain;
use super::types::{ResponseStyle, SynthesisInput, SynthesisResult};
use crate::errors::{AppError, Result};
use crate::llm::{complete_with_retry, CallStage, LlmProvider, LlmRequest, RetryPolicy};
use crate::tools::{ToolConfig, ToolName};
use regex_lite::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, error, info};

/// Hard ceiling on compact answers, in tokens
pub const COMPACT_TOKEN_CEILING: u32 = 400;

/// Heading of the appended citation section
const SOURCES_HEADING: &str = "Surse:";

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n[ \t]*\r?\n").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Token budget for `style` given the tool's configured ceiling
pub fn token_budget(style: ResponseStyle, max_tokens: u32) -> u32 {
    match style {
        ResponseStyle::Detailed => max_tokens.max(1),
        ResponseStyle::Compact => (max_tokens / 4).min(COMPACT_TOKEN_CEILING).max(1),
    }
}

/// Labeled prompt sections in fixed order; absent sources are omitted
pub fn build_prompt(input: &SynthesisInput) -> String {
    let question = input.request.original_question.trim();
    let mut sections = vec![format!("## Întrebarea cetățeanului\n{}", question)];

    let reformulated = input.reformulated_query.trim();
    if !reformulated.is_empty() && reformulated != question {
        sections.push(format!("## Interogare reformulată\n{}", reformulated));
    }

    if let Some(content) = input.regular.usable_content() {
        sections.push(format!("## Rezultate căutare web\n{}", content));
    }

    if let Some(content) = input.trusted.usable_content() {
        let domains: Vec<&str> = input.trusted.selected_domains.iter().map(String::as_str).collect();
        sections.push(format!(
            "## Rezultate din surse oficiale ({})\n{}",
            domains.join(", "),
            content
        ));
    }

    for snippet in input.active_snippets() {
        sections.push(format!("## Bază de cunoștințe [{}]\n{}", snippet.domain_tag, snippet.text_blob));
    }

    if !input.has_usable_content() {
        sections.push(
            "## Notă\nNicio sursă nu a returnat informații. Răspunde pe baza cunoștințelor generale \
             despre procedurile administrative din Timișoara și precizează că detaliile trebuie \
             verificate la instituția responsabilă."
                .to_string(),
        );
    }

    sections.join("\n\n")
}

/// Source domains the answer can cite
fn source_domains(input: &SynthesisInput) -> BTreeSet<String> {
    let mut domains = BTreeSet::new();
    for result in [&input.regular, &input.trusted] {
        if result.usable_content().is_none() {
            continue;
        }
        domains.extend(result.selected_domains.iter().cloned());
        domains.extend(
            result
                .cited_urls
                .iter()
                .map(|url| normalize_domain(url))
                .filter(|d| !d.is_empty()),
        );
    }
    domains
}

fn is_sources_heading(line: &str) -> bool {
    let cleaned = line
        .trim()
        .trim_start_matches(['#', '*', '_', ' '])
        .trim_end_matches(['*', '_', ' '])
        .to_lowercase();
    ["surse", "sources", "referințe", "referinte"]
        .iter()
        .any(|h| cleaned == *h || cleaned.starts_with(&format!("{}:", h)))
}

/// Text before the first sources heading
fn strip_sources_section(text: &str) -> &str {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if is_sources_heading(line) {
            return &text[..offset];
        }
        offset += line.len();
    }
    text
}

/// Paragraph body with its leading heading lines removed
fn without_headings(paragraph: &str) -> String {
    let body: Vec<&str> = paragraph
        .lines()
        .skip_while(|line| line.trim().is_empty() || line.trim_start().starts_with('#'))
        .collect();
    body.join("\n")
}

/// First real paragraph, whitespace collapsed, no sources section
pub fn compact_answer(text: &str) -> String {
    PARAGRAPH_BREAK
        .split(strip_sources_section(text))
        .map(|p| WHITESPACE.replace_all(&without_headings(p), " ").trim().to_string())
        .find(|p| !p.is_empty())
        .unwrap_or_default()
}

/// Append a sources section unless every domain is already cited
pub fn with_sources_section(text: &str, domains: &BTreeSet<String>) -> String {
    let text = text.trim();
    let lower = text.to_lowercase();
    if domains.is_empty() || domains.iter().all(|d| lower.contains(d.as_str())) {
        return text.to_string();
    }
    let list: Vec<String> = domains.iter().map(|d| format!("- {}", d)).collect();
    format!("{}\n\n{}\n{}", text, SOURCES_HEADING, list.join("\n"))
}

/// Tools whose output reached the answer, in pipeline order
fn tools_consulted(input: &SynthesisInput) -> Vec<String> {
    let mut tools = Vec::new();
    if input.reformulation_applied {
        tools.push(ToolName::Reformulation.to_string());
    }
    if input.regular.usable_content().is_some() {
        tools.push(ToolName::RegularSearch.to_string());
    }
    if input.trusted.usable_content().is_some() {
        tools.push(ToolName::TrustedSearch.to_string());
    }
    tools.extend(input.active_snippets().map(|s| format!("knowledge_corpus:{}", s.domain_tag)));
    tools.push(ToolName::Synthesis.to_string());
    tools
}

pub struct ResponseSynthesizer {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ResponseSynthesizer {
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            timeout,
        }
    }

    /// Produce the final answer; `SynthesisFailed` once the retry budget or
    /// the stage timeout is exhausted
    pub async fn synthesize(
        &self,
        input: &SynthesisInput,
        style: ResponseStyle,
        config: &ToolConfig,
    ) -> Result<SynthesisResult> {
        if !config.enabled {
            return Err(AppError::SynthesisFailed {
                detail: "synthesis tool is disabled".into(),
            });
        }

        let budget = token_budget(style, config.max_tokens);
        let request = LlmRequest::new(CallStage::Synthesis, &config.model, build_prompt(input))
            .with_system(synthesis_system_prompt(style == ResponseStyle::Detailed, input.as_of))
            .with_sampling(config.temperature, budget);

        debug!(style = %style, budget, version = SYNTHESIS_PROMPT_VERSION, "Synthesizing answer");

        let call = complete_with_retry(self.provider.as_ref(), &request, &self.policy);
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(error = %e, "Synthesis failed after retries");
                return Err(AppError::SynthesisFailed { detail: e.to_string() });
            }
            Err(_) => {
                error!(timeout_ms = self.timeout.as_millis() as u64, "Synthesis timed out");
                return Err(AppError::SynthesisFailed {
                    detail: "synthesis timed out".into(),
                });
            }
        };

        let final_text = match style {
            ResponseStyle::Detailed => with_sources_section(&response.text, &source_domains(input)),
            ResponseStyle::Compact => compact_answer(&response.text),
        };

        if final_text.trim().is_empty() {
            return Err(AppError::SynthesisFailed {
                detail: "synthesis produced no text".into(),
            });
        }

        let degraded = !input.has_usable_content();
        info!(style = %style, degraded, chars = final_text.chars().count(), "Answer synthesized");

        Ok(SynthesisResult {
            run_id: input.run_id,
            final_text,
            style_used: style,
            tools_consulted: tools_consulted(input),
            degraded,
            total_latency: input.started_at.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::{PipelineRequest, SearchResult};
    use crate::corpus::RagSnippetSet;
    use crate::errors::{FailureKind, SYNTHESIS_FALLBACK_MESSAGE};
    use crate::llm::{Behavior, LlmError, LlmResponse, MockProvider};
    use chrono::NaiveDate;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn input(regular: SearchResult, trusted: SearchResult) -> SynthesisInput {
        SynthesisInput {
            run_id: Uuid::new_v4(),
            started_at: Instant::now(),
            as_of: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
            request: PipelineRequest::new("taxe locuinta Timisoara", ResponseStyle::Detailed),
            reformulated_query: "impozit clădiri Timișoara 2026".into(),
            reformulation_applied: true,
            regular,
            trusted,
            snippets: Vec::new(),
        }
    }

    fn ok(tool: ToolName, text: &str) -> SearchResult {
        SearchResult::succeeded(tool, LlmResponse::text(text), Duration::ZERO)
    }

    fn trusted_ok(text: &str, domain: &str) -> SearchResult {
        ok(ToolName::TrustedSearch, text).with_selected_domains([domain.to_string()].into())
    }

    fn synthesizer(provider: MockProvider) -> (ResponseSynthesizer, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        };
        (ResponseSynthesizer::new(provider.clone(), policy, Duration::from_secs(30)), provider)
    }

    #[test]
    fn test_token_budget() {
        assert_eq!(token_budget(ResponseStyle::Detailed, 1800), 1800);
        assert_eq!(token_budget(ResponseStyle::Compact, 1800), 400);
        assert_eq!(token_budget(ResponseStyle::Compact, 800), 200);
        assert_eq!(token_budget(ResponseStyle::Compact, 3), 1);
        for max in 2..5000 {
            assert!(token_budget(ResponseStyle::Compact, max) < token_budget(ResponseStyle::Detailed, max));
        }
    }

    #[test]
    fn test_prompt_sections_in_fixed_order() {
        let mut input = input(ok(ToolName::RegularSearch, "web"), trusted_ok("oficial", "dfmt.ro"));
        input.snippets.push(Arc::new(RagSnippetSet {
            domain_tag: "impozite".into(),
            text_blob: "corpus".into(),
            entries: 1,
        }));
        let prompt = build_prompt(&input);

        let order = [
            "## Întrebarea cetățeanului",
            "## Interogare reformulată",
            "## Rezultate căutare web",
            "## Rezultate din surse oficiale (dfmt.ro)",
            "## Bază de cunoștințe [impozite]",
        ];
        let positions: Vec<usize> = order.iter().map(|label| prompt.find(label).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(!prompt.contains("## Notă"));
    }

    #[test]
    fn test_prompt_omits_failed_and_disabled_sources() {
        let mut input = input(
            SearchResult::timed_out(ToolName::RegularSearch, Duration::from_secs(45)),
            SearchResult::disabled(ToolName::TrustedSearch),
        );
        input.reformulated_query = input.request.original_question.clone();
        input.request.options.use_rag_context = false;
        input.snippets.push(Arc::new(RagSnippetSet {
            domain_tag: "impozite".into(),
            text_blob: "corpus".into(),
            entries: 1,
        }));

        let prompt = build_prompt(&input);
        assert!(!prompt.contains("Interogare reformulată"));
        assert!(!prompt.contains("Rezultate"));
        assert!(!prompt.contains("Bază de cunoștințe"));
        assert!(prompt.contains("## Notă"));
    }

    #[test]
    fn test_compact_answer_keeps_first_paragraph() {
        let text = "## Răspuns\n\nPlătiți impozitul la DFMT   până la 31 martie.\n\nDetalii suplimentare.\n\nSurse:\n- dfmt.ro";
        assert_eq!(compact_answer(text), "Plătiți impozitul la DFMT până la 31 martie.");

        assert_eq!(compact_answer("**Surse:** dfmt.ro"), "");
    }

    #[test]
    fn test_compact_answer_strips_heading_glued_to_text() {
        let text = "# Impozit pe clădiri\nPlata se face în două rate.\n\nDetalii.";
        assert_eq!(compact_answer(text), "Plata se face în două rate.");

        let nested = "## Răspuns\n### Pe scurt\n  Depuneți cererea la ghișeu.";
        assert_eq!(compact_answer(nested), "Depuneți cererea la ghișeu.");
    }

    #[test]
    fn test_sources_section_appended_when_missing() {
        let domains: BTreeSet<String> = ["dfmt.ro".to_string()].into();
        let text = with_sources_section("Impozitul se plătește anual.", &domains);
        assert!(text.ends_with("Surse:\n- dfmt.ro"));

        let cited = with_sources_section("Conform dfmt.ro, plata e anuală.", &domains);
        assert_eq!(cited, "Conform dfmt.ro, plata e anuală.");

        assert_eq!(with_sources_section(" text ", &BTreeSet::new()), "text");
    }

    #[tokio::test]
    async fn test_detailed_answer_cites_trusted_domains() {
        let (synth, provider) = synthesizer(MockProvider::new().with(
            CallStage::Synthesis,
            Behavior::reply("Impozitul pe clădiri se plătește în două rate.\n\nPrima rată: 31 martie."),
        ));
        let input = input(ok(ToolName::RegularSearch, "web"), trusted_ok("oficial", "dfmt.ro"));
        let config = ToolName::Synthesis.default_config();

        let result = synth.synthesize(&input, ResponseStyle::Detailed, &config).await.unwrap();
        assert!(result.final_text.contains("Surse:\n- dfmt.ro"));
        assert!(!result.degraded);
        assert_eq!(
            result.tools_consulted,
            vec!["reformulation", "regular_search", "trusted_search", "synthesis"]
        );
        assert_eq!(provider.calls()[0].max_tokens, config.max_tokens);
    }

    #[tokio::test]
    async fn test_compact_answer_is_single_paragraph() {
        let (synth, provider) = synthesizer(MockProvider::new().with(
            CallStage::Synthesis,
            Behavior::reply("Plata se face la DFMT.\n\nAlte detalii.\n\nSurse:\n- dfmt.ro"),
        ));
        let input = input(ok(ToolName::RegularSearch, "web"), trusted_ok("oficial", "dfmt.ro"));
        let config = ToolName::Synthesis.default_config();

        let result = synth.synthesize(&input, ResponseStyle::Compact, &config).await.unwrap();
        assert_eq!(result.final_text, "Plata se face la DFMT.");
        assert_eq!(result.style_used, ResponseStyle::Compact);
        assert_eq!(provider.calls()[0].max_tokens, 400);
    }

    #[tokio::test]
    async fn test_degraded_input_still_synthesizes() {
        let (synth, _) = synthesizer(MockProvider::new().with(CallStage::Synthesis, Behavior::reply("Răspuns general.")));
        let mut input = input(
            SearchResult::failed(ToolName::RegularSearch, FailureKind::PermanentProvider, "auth", Duration::ZERO),
            SearchResult::failed(ToolName::TrustedSearch, FailureKind::TransientProvider, "503", Duration::ZERO),
        );
        input.reformulation_applied = false;

        let result = synth
            .synthesize(&input, ResponseStyle::Detailed, &ToolName::Synthesis.default_config())
            .await
            .unwrap();
        assert!(result.degraded);
        assert_eq!(result.final_text, "Răspuns general.");
        assert_eq!(result.tools_consulted, vec!["synthesis"]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_generic_message() {
        let (synth, provider) = synthesizer(
            MockProvider::new().with(CallStage::Synthesis, Behavior::Fail(LlmError::Api {
                status: 502,
                message: "upstream exploded".into(),
            })),
        );
        let input = input(ok(ToolName::RegularSearch, "web"), trusted_ok("oficial", "dfmt.ro"));

        let err = synth
            .synthesize(&input, ResponseStyle::Detailed, &ToolName::Synthesis.default_config())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SynthesisFailed { .. }));
        assert_eq!(err.to_string(), SYNTHESIS_FALLBACK_MESSAGE);
        assert!(!err.to_string().contains("upstream"));
        assert_eq!(provider.call_count(CallStage::Synthesis), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let (synth, _) = synthesizer(MockProvider::new().with(
            CallStage::Synthesis,
            Behavior::Sequence(vec![Err(LlmError::Timeout), Ok("A doua încercare.".into())]),
        ));
        let input = input(ok(ToolName::RegularSearch, "web"), trusted_ok("oficial", "dfmt.ro"));

        let result = synth
            .synthesize(&input, ResponseStyle::Compact, &ToolName::Synthesis.default_config())
            .await
            .unwrap();
        assert_eq!(result.final_text, "A doua încercare.");
    }
}
