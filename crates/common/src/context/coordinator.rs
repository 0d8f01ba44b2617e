//! Pipeline coordinator
//!
//! Drives one question through the fixed state machine:
//!
//! ```text
//! Start -> Reformulating -> Retrieving -> Synthesizing -> Done
//!                                                      \-> Failed
//! ```
//!
//! Tool settings are snapshotted once at the start of the run. Retrieval is
//! bounded by a single deadline covering both search branches and the corpus
//! lookups; whatever is still pending when it expires is dropped and recorded
//! as a timeout. Only synthesis can fail the run. A run that outlives
//! `run_timeout_ms` is cut off where it stands: its trace keeps the last
//! state reached plus a `pipeline` timeout entry, and is still audited.

use super::reformulator::QueryReformulator;
use super::search::{normalize_domain, SearchConfigs, SearchOrchestrator};
use super::synthesizer::{build_prompt, ResponseSynthesizer};
use super::trace::{ExecutionTrace, StageError};
use super::types::{PipelineRequest, ResponseStyle, SearchResult, SynthesisInput, SynthesisResult};
use crate::audit::{self, AuditSink};
use crate::config::PipelineConfig;
use crate::corpus::{KnowledgeCorpusCache, RagSnippetSet};
use crate::errors::{AppError, FailureKind, Result};
use crate::llm::{LlmProvider, RetryPolicy};
use crate::metrics;
use crate::tools::{ToolConfig, ToolConfigStore, ToolName};
use chrono::Local;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Start,
    Reformulating,
    Retrieving,
    Synthesizing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Start, Reformulating)
                | (Reformulating, Retrieving)
                | (Retrieving, Synthesizing)
                | (Synthesizing, Done)
                | (Synthesizing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

/// Answer (or failure) of one run together with its trace
#[derive(Debug)]
pub struct PipelineRun {
    pub result: Result<SynthesisResult>,
    pub trace: ExecutionTrace,
}

/// Mutable bookkeeping for a single run
struct RunState {
    state: PipelineState,
    trace: ExecutionTrace,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        Self {
            state: PipelineState::Start,
            trace: ExecutionTrace::new(run_id),
        }
    }

    fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::Internal {
                message: format!("illegal pipeline transition {:?} -> {:?}", self.state, next),
            });
        }
        debug!(from = ?self.state, to = ?next, "Pipeline transition");
        self.state = next;
        self.trace.states.push(next);
        Ok(())
    }

    fn record(&mut self, stage: &str, input: &str, output: Option<&str>, duration: Duration, error: Option<StageError>) {
        metrics::record_stage(stage, duration.as_secs_f64(), error.as_ref().map(|e| e.kind.as_str()));
        self.trace.record(stage, input, output, duration, error);
    }

    fn record_search(&mut self, query: &str, result: &SearchResult) {
        if !result.attempted() {
            return;
        }
        let error = result.error.map(|kind| {
            StageError::new(kind, result.error_message.clone().unwrap_or_else(|| kind.as_str().to_string()))
        });
        self.record(
            result.tool_name.as_str(),
            query,
            result.content.as_deref().filter(|_| result.success),
            result.latency,
            error,
        );
    }
}

struct CorpusLookup {
    tag: String,
    outcome: std::result::Result<Arc<RagSnippetSet>, StageError>,
    duration: Duration,
}

fn gated(mut config: ToolConfig, allowed: bool) -> ToolConfig {
    config.enabled &= allowed;
    config
}

pub struct PipelineCoordinator {
    settings: PipelineConfig,
    tools: Arc<ToolConfigStore>,
    corpus: Arc<KnowledgeCorpusCache>,
    reformulator: QueryReformulator,
    search: SearchOrchestrator,
    synthesizer: ResponseSynthesizer,
    audit: Arc<dyn AuditSink>,
}

impl PipelineCoordinator {
    pub fn new(
        settings: PipelineConfig,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolConfigStore>,
        corpus: Arc<KnowledgeCorpusCache>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let reformulator = QueryReformulator::new(provider.clone(), settings.reformulation_timeout());
        let search = SearchOrchestrator::new(
            provider.clone(),
            RetryPolicy::from(&settings.search_retry),
            settings.search_timeout(),
        );
        let synthesizer = ResponseSynthesizer::new(
            provider,
            RetryPolicy::from(&settings.synthesis_retry),
            settings.synthesis_timeout(),
        );

        Self {
            settings,
            tools,
            corpus,
            reformulator,
            search,
            synthesizer,
            audit,
        }
    }

    /// Request carrying the configured pipeline options
    pub fn request(&self, question: impl Into<String>, style: ResponseStyle) -> PipelineRequest {
        PipelineRequest::new(question, style).with_options(self.settings.options.clone())
    }

    pub fn tools(&self) -> &Arc<ToolConfigStore> {
        &self.tools
    }

    /// Answer `question` with the configured options
    pub async fn run_pipeline(
        &self,
        question: &str,
        style: ResponseStyle,
        trusted_domains: &[String],
        knowledge_domain_tags: &[String],
    ) -> Result<SynthesisResult> {
        let request = self
            .request(question, style)
            .with_trusted_domains(trusted_domains.to_vec())
            .with_knowledge_tags(knowledge_domain_tags.to_vec());
        self.run(request).await
    }

    /// Run the pipeline and hand the outcome to the audit sink
    pub async fn run(&self, request: PipelineRequest) -> Result<SynthesisResult> {
        let PipelineRun { result, trace } = self.execute(request).await?;
        audit::dispatch(self.audit.clone(), trace, result.as_ref().ok().cloned());
        result
    }

    /// Run the pipeline without auditing. Fails early only on an invalid
    /// request; stage failures live in the returned run.
    pub async fn execute(&self, request: PipelineRequest) -> Result<PipelineRun> {
        request.validate()?;

        let run_id = Uuid::new_v4();
        let span = info_span!(
            "pipeline_run",
            %run_id,
            style = %request.style,
            session = request.session_context.as_deref().unwrap_or("-"),
        );

        let mut run = RunState::new(run_id);
        run.trace.session_context = request.session_context.clone();
        let question = request.original_question.trim().to_string();
        let style = request.style;

        let budget = self.settings.run_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(budget, self.drive(&mut run, request))
            .instrument(span)
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                let budget_ms = budget.as_millis() as u64;
                run.record(
                    "pipeline",
                    &question,
                    None,
                    started.elapsed(),
                    Some(StageError::new(
                        FailureKind::Timeout,
                        format!("run exceeded {}ms while {:?}", budget_ms, run.state),
                    )),
                );
                metrics::record_run(started.elapsed().as_secs_f64(), style.as_str(), "timeout");
                warn!(%run_id, state = ?run.state, budget_ms, "Pipeline run exceeded its budget");
                Err(AppError::RunTimeout { budget_ms })
            }
        };

        Ok(PipelineRun {
            result,
            trace: run.trace,
        })
    }

    async fn drive(&self, run: &mut RunState, mut request: PipelineRequest) -> Result<SynthesisResult> {
        let started = Instant::now();
        let style = request.style;
        request.original_question = request.original_question.trim().to_string();
        let question = request.original_question.clone();

        let snapshot = self.tools.snapshot().await;
        let as_of = Local::now().date_naive();
        info!(chars = question.chars().count(), "Pipeline run started");

        run.advance(PipelineState::Reformulating)?;
        let stage_started = Instant::now();
        let reformulation = self
            .reformulator
            .reformulate_detailed(&question, as_of, &snapshot.tool(ToolName::Reformulation))
            .await;
        if reformulation.attempted {
            let output = reformulation.applied().then_some(reformulation.query.as_str());
            run.record(
                ToolName::Reformulation.as_str(),
                &question,
                output,
                stage_started.elapsed(),
                reformulation.error.clone(),
            );
        }
        let query = reformulation.query.clone();

        run.advance(PipelineState::Retrieving)?;
        let deadline = Instant::now() + self.settings.retrieval_deadline();
        let allowlist = self.trusted_allowlist(&request);
        let configs = SearchConfigs {
            regular: gated(
                snapshot.tool(ToolName::RegularSearch),
                request.options.use_regular_web_search,
            ),
            trusted: gated(
                snapshot.tool(ToolName::TrustedSearch),
                request.options.use_trusted_sites_search,
            ),
        };
        let tags = corpus_tags(&request);

        let ((regular, trusted), lookups) = tokio::join!(
            self.search.search_until(&query, &allowlist, &configs, Some(deadline)),
            self.lookup_corpus(&tags, deadline),
        );

        run.record_search(&query, &regular);
        run.record_search(&query, &trusted);

        let mut snippets = Vec::new();
        for lookup in lookups {
            let stage = format!("knowledge_corpus:{}", lookup.tag);
            match lookup.outcome {
                Ok(set) => {
                    run.record(&stage, &lookup.tag, Some(&set.text_blob), lookup.duration, None);
                    snippets.push(set);
                }
                Err(error) => run.record(&stage, &lookup.tag, None, lookup.duration, Some(error)),
            }
        }

        run.advance(PipelineState::Synthesizing)?;
        let input = SynthesisInput {
            run_id: run.trace.run_id,
            started_at: started,
            as_of,
            request,
            reformulated_query: query,
            reformulation_applied: reformulation.applied(),
            regular,
            trusted,
            snippets,
        };
        if !input.has_usable_content() {
            warn!("No retrieval source produced content, answering from the question alone");
        }

        let prompt = build_prompt(&input);
        let stage_started = Instant::now();
        let outcome = self
            .synthesizer
            .synthesize(&input, style, &snapshot.tool(ToolName::Synthesis))
            .await;

        match outcome {
            Ok(result) => {
                run.record(
                    ToolName::Synthesis.as_str(),
                    &prompt,
                    Some(&result.final_text),
                    stage_started.elapsed(),
                    None,
                );
                run.advance(PipelineState::Done)?;
                metrics::record_run(started.elapsed().as_secs_f64(), style.as_str(), "done");
                info!(
                    degraded = result.degraded,
                    tools = ?result.tools_consulted,
                    latency_ms = result.total_latency.as_millis() as u64,
                    "Pipeline run finished"
                );
                Ok(result)
            }
            Err(e) => {
                let detail = match &e {
                    AppError::SynthesisFailed { detail } => detail.clone(),
                    other => other.to_string(),
                };
                run.record(
                    ToolName::Synthesis.as_str(),
                    &prompt,
                    None,
                    stage_started.elapsed(),
                    Some(StageError::new(FailureKind::SynthesisFailed, detail)),
                );
                run.advance(PipelineState::Failed)?;
                metrics::record_run(started.elapsed().as_secs_f64(), style.as_str(), "failed");
                warn!("Pipeline run failed at synthesis");
                Err(e)
            }
        }
    }

    /// Request domains, or the configured defaults when none were given
    fn trusted_allowlist(&self, request: &PipelineRequest) -> BTreeSet<String> {
        let normalize = |domains: &[String]| -> BTreeSet<String> {
            domains
                .iter()
                .map(|d| normalize_domain(d))
                .filter(|d| !d.is_empty())
                .collect()
        };

        let requested = normalize(&request.trusted_domains);
        if requested.is_empty() {
            normalize(&self.settings.default_trusted_domains)
        } else {
            requested
        }
    }

    async fn lookup_corpus(&self, tags: &[String], deadline: Instant) -> Vec<CorpusLookup> {
        join_all(tags.iter().map(|tag| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout_at(deadline, self.corpus.get(tag)).await {
                Ok(Ok(set)) => Ok(set),
                Ok(Err(e)) => {
                    debug!(tag = %tag, error = %e, "No knowledge corpus for tag");
                    Err(StageError::new(FailureKind::CorpusNotFound, e.to_string()))
                }
                Err(_) => Err(StageError::new(
                    FailureKind::Timeout,
                    format!("corpus '{}' not loaded before the retrieval deadline", tag),
                )),
            };
            CorpusLookup {
                tag: tag.clone(),
                outcome,
                duration: started.elapsed(),
            }
        }))
        .await
    }
}

/// Tags to look up, deduplicated in request order
fn corpus_tags(request: &PipelineRequest) -> Vec<String> {
    if !request.options.use_rag_context {
        return Vec::new();
    }
    let source = if request.knowledge_domain_tags.is_empty() {
        &request.options.rag_domains
    } else {
        &request.knowledge_domain_tags
    };

    let mut seen = BTreeSet::new();
    source
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}
