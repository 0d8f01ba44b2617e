//! Scripted provider for tests and offline runs

use super::{CallStage, LlmError, LlmProvider, LlmRequest, LlmResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Arc<dyn Fn(&LlmRequest) -> Result<LlmResponse, LlmError> + Send + Sync>;

/// What the mock does when a given stage calls it
#[derive(Clone)]
pub enum Behavior {
    /// Always answer with this text
    Reply(String),
    /// Answer with text and cited URLs
    ReplyWithCitations(String, Vec<String>),
    /// Always fail
    Fail(LlmError),
    /// Walk through outcomes call by call; the last one repeats
    Sequence(Vec<Result<String, LlmError>>),
    /// Sleep, then behave as the inner behavior
    Delay(Duration, Box<Behavior>),
    /// Compute the answer from the request
    Respond(Responder),
}

impl Behavior {
    pub fn reply(text: impl Into<String>) -> Self {
        Behavior::Reply(text.into())
    }

    pub fn delayed(delay: Duration, inner: Behavior) -> Self {
        Behavior::Delay(delay, Box::new(inner))
    }

    pub fn respond<F>(f: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<LlmResponse, LlmError> + Send + Sync + 'static,
    {
        Behavior::Respond(Arc::new(f))
    }
}

/// Mock provider routing on `CallStage`
#[derive(Default)]
pub struct MockProvider {
    behaviors: HashMap<CallStage, Behavior>,
    calls: Mutex<Vec<LlmRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: CallStage, behavior: Behavior) -> Self {
        self.behaviors.insert(stage, behavior);
        self
    }

    /// Every request received so far, in arrival order
    pub fn calls(&self) -> Vec<LlmRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, stage: CallStage) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.stage == stage).count())
            .unwrap_or(0)
    }

    fn record(&self, request: &LlmRequest) -> usize {
        match self.calls.lock() {
            Ok(mut calls) => {
                let previous = calls.iter().filter(|r| r.stage == request.stage).count();
                calls.push(request.clone());
                previous
            }
            Err(_) => 0,
        }
    }

    fn default_reply(request: &LlmRequest) -> LlmResponse {
        LlmResponse::text(format!("[mock {}] {}", request.stage, request.prompt.lines().next().unwrap_or_default()))
    }
}

async fn run(behavior: &Behavior, request: &LlmRequest, index: usize) -> Result<LlmResponse, LlmError> {
    let mut current = behavior;
    loop {
        match current {
            Behavior::Reply(text) => return Ok(LlmResponse::text(text.clone())),
            Behavior::ReplyWithCitations(text, urls) => {
                return Ok(LlmResponse {
                    text: text.clone(),
                    cited_urls: urls.clone(),
                })
            }
            Behavior::Fail(err) => return Err(err.clone()),
            Behavior::Sequence(outcomes) => {
                let outcome = outcomes
                    .get(index)
                    .or_else(|| outcomes.last())
                    .cloned()
                    .unwrap_or(Err(LlmError::EmptyResponse));
                return outcome.map(LlmResponse::text);
            }
            Behavior::Delay(delay, inner) => {
                tokio::time::sleep(*delay).await;
                current = inner;
            }
            Behavior::Respond(f) => return f(request),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let index = self.record(request);
        match self.behaviors.get(&request.stage) {
            Some(behavior) => run(behavior, request, index).await,
            None => Ok(Self::default_reply(request)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
