//! Configuration management for Civica services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values
//!
//! `AppConfig` is loaded once at process start and passed explicitly to the
//! pipeline. Per-tool model settings live in the `ToolConfigStore` instead,
//! which has its own reload operation.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// LLM provider credentials and transport
    #[serde(default)]
    pub llm: LlmConfig,

    /// Pipeline deadlines, retries and source toggles
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Tool configuration store location
    #[serde(default)]
    pub tools: ToolStoreConfig,

    /// Audit collaborator
    #[serde(default)]
    pub audit: AuditConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// API key; calls fail with missing credentials when absent
    pub api_key: Option<String>,

    /// API base URL (OpenAI-compatible)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Per-call HTTP timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Use the scripted mock provider instead of the network
    #[serde(default)]
    pub mock: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Overall deadline for the retrieval stage (both searches + corpus)
    #[serde(default = "default_retrieval_deadline")]
    pub retrieval_deadline_ms: u64,

    /// Per-branch timeout for each search branch
    #[serde(default = "default_search_timeout")]
    pub search_timeout_ms: u64,

    /// Timeout for the single reformulation call
    #[serde(default = "default_reformulation_timeout")]
    pub reformulation_timeout_ms: u64,

    /// Timeout for the whole synthesis stage including retries
    #[serde(default = "default_synthesis_timeout")]
    pub synthesis_timeout_ms: u64,

    /// Backstop for a whole run; keep above the sum of the stage budgets
    #[serde(default = "default_run_timeout")]
    pub run_timeout_ms: u64,

    /// Retry policy for both search branches
    #[serde(default)]
    pub search_retry: RetryConfig,

    /// Retry policy for the synthesis call
    #[serde(default)]
    pub synthesis_retry: RetryConfig,

    /// Allowlist used when a request names no trusted domains
    #[serde(default = "default_trusted_domains")]
    pub default_trusted_domains: Vec<String>,

    /// Source toggles
    #[serde(default)]
    pub options: PipelineOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Recognized pipeline options
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PipelineOptions {
    #[serde(default = "default_true")]
    pub use_rag_context: bool,

    /// Corpus tags used when a request names none
    #[serde(default)]
    pub rag_domains: Vec<String>,

    /// Directory holding `<tag>.txt` corpus files
    #[serde(default = "default_rag_context_path")]
    pub rag_context_path: String,

    #[serde(default = "default_true")]
    pub use_trusted_sites_search: bool,

    #[serde(default = "default_true")]
    pub use_regular_web_search: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolStoreConfig {
    /// JSON file backing the ToolConfigStore
    #[serde(default = "default_tools_path")]
    pub config_path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Append execution records as JSON lines here; log-only when unset
    pub jsonl_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_api_base() -> String { "https://api.openai.com/v1".to_string() }
fn default_llm_timeout() -> u64 { 60 }
fn default_retrieval_deadline() -> u64 { 45_000 }
fn default_search_timeout() -> u64 { 40_000 }
fn default_reformulation_timeout() -> u64 { 15_000 }
fn default_synthesis_timeout() -> u64 { 120_000 }
fn default_run_timeout() -> u64 { 200_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 8_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_true() -> bool { true }
fn default_rag_context_path() -> String { "data/rag".to_string() }
fn default_tools_path() -> String { "config/tools.json".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "civica-context".to_string() }

fn default_trusted_domains() -> Vec<String> {
    ["primariatm.ro", "dfmt.ro", "aquatim.ro", "colterm.ro", "stpt.ro", "anaf.ro"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_api_base(),
            timeout_secs: default_llm_timeout(),
            mock: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retrieval_deadline_ms: default_retrieval_deadline(),
            search_timeout_ms: default_search_timeout(),
            reformulation_timeout_ms: default_reformulation_timeout(),
            synthesis_timeout_ms: default_synthesis_timeout(),
            run_timeout_ms: default_run_timeout(),
            search_retry: RetryConfig::default(),
            synthesis_retry: RetryConfig::default(),
            default_trusted_domains: default_trusted_domains(),
            options: PipelineOptions::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            use_rag_context: true,
            rag_domains: Vec::new(),
            rag_context_path: default_rag_context_path(),
            use_trusted_sites_search: true,
            use_regular_web_search: true,
        }
    }
}

impl Default for ToolStoreConfig {
    fn default() -> Self {
        Self {
            config_path: default_tools_path(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            pipeline: PipelineConfig::default(),
            tools: ToolStoreConfig::default(),
            audit: AuditConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__PIPELINE__RETRIEVAL_DEADLINE_MS=30000
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pipeline.default_trusted_domains")
                    .with_list_parse_key("pipeline.options.rag_domains"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl PipelineConfig {
    pub fn retrieval_deadline(&self) -> Duration {
        Duration::from_millis(self.retrieval_deadline_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn reformulation_timeout(&self) -> Duration {
        Duration::from_millis(self.reformulation_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Longest a run can spend in its stages before the backstop matters
    pub fn stage_budget(&self) -> Duration {
        self.reformulation_timeout() + self.retrieval_deadline() + self.synthesis_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.llm.api_base, "https://api.openai.com/v1");
        assert!(config.pipeline.default_trusted_domains.contains(&"dfmt.ro".to_string()));
        assert!(config.pipeline.options.use_regular_web_search);
        assert!(config.pipeline.run_timeout() > config.pipeline.stage_budget());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                "[pipeline]\nretrieval_deadline_ms = 1000\n[pipeline.options]\nuse_rag_context = false\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.retrieval_deadline(), Duration::from_secs(1));
        assert!(!config.pipeline.options.use_rag_context);
        assert!(config.pipeline.options.use_trusted_sites_search);
        assert_eq!(config.pipeline.search_retry.max_attempts, 3);
        assert_eq!(config.observability.metrics_port, 9090);
    }
}
