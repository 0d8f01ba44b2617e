//! Run auditing
//!
//! Every finished run hands its trace (and the answer, when there is one) to
//! an [`AuditSink`]. Sinks run on a detached task, so a slow or broken sink
//! never delays or fails the caller.

use crate::context::{ExecutionTrace, SynthesisResult};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_execution(&self, trace: &ExecutionTrace, result: Option<&SynthesisResult>) -> Result<()>;
}

/// Audit line written per run
#[derive(Debug, Serialize)]
pub struct AuditRecord<'a> {
    pub trace: &'a ExecutionTrace,
    pub result: Option<&'a SynthesisResult>,
}

/// Emits a structured log event per run
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_execution(&self, trace: &ExecutionTrace, result: Option<&SynthesisResult>) -> Result<()> {
        let failed_stages: Vec<&str> = trace
            .entries
            .iter()
            .filter(|e| e.error.is_some())
            .map(|e| e.stage_name.as_str())
            .collect();

        info!(
            run_id = %trace.run_id,
            final_state = ?trace.final_state(),
            stages = trace.entries.len(),
            failed_stages = ?failed_stages,
            tools = ?result.map(|r| &r.tools_consulted),
            latency_ms = result.map(|r| r.total_latency.as_millis() as u64),
            "Pipeline run audited"
        );
        Ok(())
    }
}

/// Appends one JSON object per run to a file
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record_execution(&self, trace: &ExecutionTrace, result: Option<&SynthesisResult>) -> Result<()> {
        let mut line = serde_json::to_vec(&AuditRecord { trace, result })?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AppError::Audit {
                message: format!("Failed to open {}: {}", self.path.display(), e),
            })?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Hand a finished run to `sink` without waiting for it
pub fn dispatch(
    sink: Arc<dyn AuditSink>,
    trace: ExecutionTrace,
    result: Option<SynthesisResult>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.record_execution(&trace, result.as_ref()).await {
            warn!(run_id = %trace.run_id, error = %e, "Audit sink failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PipelineState, ResponseStyle};
    use std::time::Duration;
    use uuid::Uuid;

    fn finished_trace() -> ExecutionTrace {
        let mut trace = ExecutionTrace::new(Uuid::new_v4());
        trace.record("synthesis", "prompt", Some("answer"), Duration::from_millis(20), None);
        trace.states.push(PipelineState::Done);
        trace
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let path = std::env::temp_dir()
            .join(format!("civica-audit-{}", Uuid::new_v4()))
            .join("runs.jsonl");
        let sink = JsonlAuditSink::new(&path);

        let trace = finished_trace();
        let result = SynthesisResult {
            run_id: trace.run_id,
            final_text: "Răspuns".into(),
            style_used: ResponseStyle::Compact,
            tools_consulted: vec!["synthesis".into()],
            degraded: true,
            total_latency: Duration::from_millis(30),
        };

        sink.record_execution(&trace, Some(&result)).await.unwrap();
        sink.record_execution(&trace, None).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = written.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["result"]["final_text"], "Răspuns");
        assert_eq!(lines[0]["trace"]["states"][1], "done");
        assert!(lines[1]["result"].is_null());

        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record_execution(&self, _: &ExecutionTrace, _: Option<&SynthesisResult>) -> Result<()> {
            Err(AppError::Audit {
                message: "disk full".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_swallows_sink_errors() {
        tokio_test::assert_ok!(dispatch(Arc::new(BrokenSink), finished_trace(), None).await);
        tokio_test::assert_ok!(dispatch(Arc::new(TracingAuditSink), finished_trace(), None).await);
    }
}
