//! Per-run execution trace
//!
//! One entry per attempted stage, with digests of what went in and came out.
//! Stages that were switched off leave no entry.

use super::coordinator::PipelineState;
use super::types::serialize_ms;
use crate::errors::FailureKind;
use crate::llm::LlmError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

/// Hex characters kept from each sha256 digest
const DIGEST_LEN: usize = 16;

/// Truncated sha256 of `text`, enough to correlate runs without storing content
pub fn digest(text: &str) -> String {
    let mut hex = hex::encode(Sha256::digest(text.as_bytes()));
    hex.truncate(DIGEST_LEN);
    hex
}

/// Why a stage did not produce output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&LlmError> for StageError {
    fn from(err: &LlmError) -> Self {
        Self::new(FailureKind::from(err), err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub stage_name: String,
    pub input_digest: String,
    pub output_digest: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_ms")]
    pub duration: Duration,
    pub error: Option<StageError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionTrace {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_context: Option<String>,
    pub entries: Vec<TraceEntry>,
    /// Every state the run passed through, starting with `Start`
    pub states: Vec<PipelineState>,
}

impl ExecutionTrace {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            session_context: None,
            entries: Vec::new(),
            states: vec![PipelineState::Start],
        }
    }

    /// Append an entry for one attempted stage
    pub fn record(
        &mut self,
        stage_name: impl Into<String>,
        input: &str,
        output: Option<&str>,
        duration: Duration,
        error: Option<StageError>,
    ) {
        self.entries.push(TraceEntry {
            stage_name: stage_name.into(),
            input_digest: digest(input),
            output_digest: output.map(digest),
            duration,
            error,
        });
    }

    pub fn entry(&self, stage_name: &str) -> Option<&TraceEntry> {
        self.entries.iter().find(|e| e.stage_name == stage_name)
    }

    pub fn final_state(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Start)
    }
}
