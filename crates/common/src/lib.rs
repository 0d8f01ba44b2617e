//! Civica Common Library
//!
//! Shared code for the Civica answering service including:
//! - Question-answering pipeline (reformulation, search, synthesis)
//! - LLM provider abstraction with retry
//! - Tool configuration store
//! - Knowledge corpus cache
//! - Error types and handling
//! - Configuration management
//! - Audit sinks, metrics and observability

pub mod audit;
pub mod config;
pub mod context;
pub mod corpus;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod tools;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
