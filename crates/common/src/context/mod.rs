//! Question-answering pipeline
//!
//! The pipeline turns one citizen question into an answer:
//! - Query reformulation (degrades to the original question)
//! - Concurrent open web and trusted-domain search
//! - Knowledge corpus lookups
//! - Style-aware synthesis
//! - Per-run execution trace

mod coordinator;
mod prompts;
mod reformulator;
mod search;
mod synthesizer;
mod trace;
mod types;

pub use coordinator::{PipelineCoordinator, PipelineRun, PipelineState};
pub use prompts::{REFORMULATION_PROMPT_VERSION, SYNTHESIS_PROMPT_VERSION};
pub use reformulator::{QueryReformulator, Reformulation};
pub use search::{normalize_domain, SearchConfigs, SearchOrchestrator};
pub use synthesizer::{build_prompt, compact_answer, token_budget, ResponseSynthesizer, COMPACT_TOKEN_CEILING};
pub use trace::{digest, ExecutionTrace, StageError, TraceEntry};
pub use types::{PipelineRequest, ResponseStyle, SearchResult, SynthesisInput, SynthesisResult, MAX_QUESTION_CHARS};
