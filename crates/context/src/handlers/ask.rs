//! Question answering handler

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use civica_common::{
    context::{ResponseStyle, SynthesisResult},
    errors::{AppError, Result},
};

/// Citizen question
#[derive(Debug, Deserialize, Validate)]
pub struct AskRequest {
    #[validate(length(min = 1, max = 2000))]
    pub question: String,

    #[serde(default)]
    pub style: ResponseStyle,

    /// Allowlist for trusted search; empty uses the configured default
    #[serde(default)]
    pub trusted_domains: Vec<String>,

    /// Knowledge corpus tags; empty uses the configured `rag_domains`
    #[serde(default)]
    pub knowledge_domain_tags: Vec<String>,

    /// Opaque caller reference carried into logs and audit records
    #[serde(alias = "session_id")]
    #[validate(length(max = 256))]
    pub session_context: Option<String>,

    #[serde(default)]
    pub options: SourceToggles,
}

/// Per-request overrides of the configured source toggles
#[derive(Debug, Default, Deserialize)]
pub struct SourceToggles {
    pub use_rag_context: Option<bool>,
    pub use_trusted_sites_search: Option<bool>,
    pub use_regular_web_search: Option<bool>,
    pub rag_domains: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub run_id: Uuid,
    pub answer: String,
    pub style: ResponseStyle,
    pub tools_consulted: Vec<String>,
    pub degraded: bool,
    pub latency_ms: u64,
}

impl From<SynthesisResult> for AskResponse {
    fn from(result: SynthesisResult) -> Self {
        Self {
            run_id: result.run_id,
            answer: result.final_text,
            style: result.style_used,
            tools_consulted: result.tools_consulted,
            degraded: result.degraded,
            latency_ms: result.total_latency.as_millis() as u64,
        }
    }
}

/// Run the answering pipeline for one question
pub async fn ask(State(state): State<AppState>, Json(body): Json<AskRequest>) -> Result<Json<AskResponse>> {
    body.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let mut request = state
        .coordinator
        .request(body.question, body.style)
        .with_trusted_domains(body.trusted_domains)
        .with_knowledge_tags(body.knowledge_domain_tags);
    if let Some(session) = body.session_context {
        request = request.with_session(session);
    }

    let toggles = body.options;
    if let Some(enabled) = toggles.use_rag_context {
        request.options.use_rag_context = enabled;
    }
    if let Some(enabled) = toggles.use_trusted_sites_search {
        request.options.use_trusted_sites_search = enabled;
    }
    if let Some(enabled) = toggles.use_regular_web_search {
        request.options.use_regular_web_search = enabled;
    }
    if let Some(domains) = toggles.rag_domains {
        request.options.rag_domains = domains;
    }

    let result = state.coordinator.run(request).await?;

    tracing::info!(
        run_id = %result.run_id,
        style = %result.style_used,
        degraded = result.degraded,
        latency_ms = result.total_latency.as_millis() as u64,
        "Question answered"
    );

    Ok(Json(result.into()))
}

#[cfg(test)]
mod tests {
    use crate::test_support::{router, send};
    use axum::http::StatusCode;
    use civica_common::errors::SYNTHESIS_FALLBACK_MESSAGE;
    use civica_common::llm::{Behavior, CallStage, LlmError, MockProvider};
    use serde_json::json;

    #[tokio::test]
    async fn test_ask_returns_answer() {
        let (app, _) = router(
            MockProvider::new()
                .with(CallStage::DomainSelection, Behavior::reply(r#"{"domains":["dfmt.ro"]}"#))
                .with(CallStage::TrustedSearch, Behavior::reply("DFMT: plata până la 31 martie."))
                .with(
                    CallStage::Synthesis,
                    Behavior::reply("Impozitul se plătește la DFMT.\n\nDetalii despre rate."),
                ),
        );

        let (status, body) = send(
            app,
            "POST",
            "/v1/ask",
            Some(json!({
                "question": "taxe locuinta Timisoara",
                "style": "compact",
                "trusted_domains": ["dfmt.ro"]
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], "Impozitul se plătește la DFMT.");
        assert_eq!(body["style"], "compact");
        assert_eq!(body["degraded"], false);
        assert!(body["tools_consulted"]
            .as_array()
            .unwrap()
            .contains(&json!("trusted_search")));
    }

    #[tokio::test]
    async fn test_ask_rejects_empty_question() {
        let (app, _) = router(MockProvider::new());
        let (status, body) = send(app.clone(), "POST", "/v1/ask", Some(json!({ "question": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, _) = send(app, "POST", "/v1/ask", Some(json!({ "question": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_503_with_generic_message() {
        let (app, _) = router(MockProvider::new().with(
            CallStage::Synthesis,
            Behavior::Fail(LlmError::Authentication("key sk-123 revoked".into())),
        ));

        let (status, body) = send(app, "POST", "/v1/ask", Some(json!({ "question": "taxe" }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["message"], SYNTHESIS_FALLBACK_MESSAGE);
        assert!(!body.to_string().contains("sk-123"));
    }

    #[tokio::test]
    async fn test_toggles_disable_sources() {
        let provider = MockProvider::new();
        let (app, _) = router(provider);

        let (status, body) = send(
            app,
            "POST",
            "/v1/ask",
            Some(json!({
                "question": "program ghiseu DFMT",
                "options": { "use_regular_web_search": false, "use_trusted_sites_search": false }
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["degraded"], true);
        assert_eq!(body["tools_consulted"], json!(["reformulation", "synthesis"]));
    }
}
