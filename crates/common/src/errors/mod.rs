//! Error types for Civica services
//!
//! Provides:
//! - The crate-wide `AppError` with machine-readable codes
//! - HTTP status code mapping and structured error responses
//! - `FailureKind`, the serializable failure classification stored in traces

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Message shown to the citizen when no answer could be produced.
pub const SYNTHESIS_FALLBACK_MESSAGE: &str =
    "Ne pare rău, nu am putut genera un răspuns în acest moment. Vă rugăm să încercați din nou în câteva minute.";

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    ConfigValidationError,

    // Resource errors (4xxx)
    ConfigNotFound,
    CorpusNotFound,

    // External service errors (8xxx)
    SynthesisFailed,
    RunTimeout,
    AuditError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
    StorageError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::ConfigValidationError => 1002,

            ErrorCode::ConfigNotFound => 4001,
            ErrorCode::CorpusNotFound => 4002,

            ErrorCode::SynthesisFailed => 8003,
            ErrorCode::RunTimeout => 8005,
            ErrorCode::AuditError => 8004,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
            ErrorCode::StorageError => 9004,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid configuration for tool '{tool}': {message}")]
    ConfigValidation {
        tool: String,
        field: String,
        message: String,
    },

    #[error("Unknown tool: {tool}")]
    ConfigNotFound { tool: String },

    #[error("No knowledge corpus for domain tag '{tag}'")]
    CorpusNotFound { tag: String },

    /// Display is the citizen-facing fallback; the provider detail stays in
    /// `detail` for logs only.
    #[error("{}", SYNTHESIS_FALLBACK_MESSAGE)]
    SynthesisFailed { detail: String },

    /// The run exceeded its overall budget before settling
    #[error("{}", SYNTHESIS_FALLBACK_MESSAGE)]
    RunTimeout { budget_ms: u64 },

    #[error("Audit error: {message}")]
    Audit { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::ConfigValidation { .. } => ErrorCode::ConfigValidationError,
            AppError::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            AppError::CorpusNotFound { .. } => ErrorCode::CorpusNotFound,
            AppError::SynthesisFailed { .. } => ErrorCode::SynthesisFailed,
            AppError::RunTimeout { .. } => ErrorCode::RunTimeout,
            AppError::Audit { .. } => ErrorCode::AuditError,
            AppError::Storage { .. } => ErrorCode::StorageError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } | AppError::ConfigValidation { .. } => {
                StatusCode::BAD_REQUEST
            }

            AppError::ConfigNotFound { .. } | AppError::CorpusNotFound { .. } => {
                StatusCode::NOT_FOUND
            }

            AppError::SynthesisFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,

            AppError::RunTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            AppError::Audit { .. }
            | AppError::Storage { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    fn field(&self) -> Option<String> {
        match self {
            AppError::Validation { field, .. } => field.clone(),
            AppError::ConfigValidation { field, .. } => Some(field.clone()),
            _ => None,
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if let AppError::SynthesisFailed { detail } = &self {
            tracing::error!(
                detail = %detail,
                code = ?code,
                status = status.as_u16(),
                "Synthesis failed"
            );
        } else if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                field: self.field(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage {
            message: err.to_string(),
        }
    }
}

/// Failure classification recorded in search results and trace entries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, rate limits, transient upstream errors
    TransientProvider,
    /// Auth failures, malformed requests, missing credentials
    PermanentProvider,
    /// The stage did not settle before its deadline
    Timeout,
    /// The provider answered with no usable text
    EmptyResponse,
    /// No knowledge corpus exists for the requested tag
    CorpusNotFound,
    /// The tool is switched off for this run
    Disabled,
    /// Final synthesis exhausted its retry budget
    SynthesisFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientProvider => "transient_provider",
            FailureKind::PermanentProvider => "permanent_provider",
            FailureKind::Timeout => "timeout",
            FailureKind::EmptyResponse => "empty_response",
            FailureKind::CorpusNotFound => "corpus_not_found",
            FailureKind::Disabled => "disabled",
            FailureKind::SynthesisFailed => "synthesis_failed",
        }
    }
}

impl From<&LlmError> for FailureKind {
    fn from(err: &LlmError) -> Self {
        match err {
            LlmError::Timeout => FailureKind::Timeout,
            LlmError::EmptyResponse => FailureKind::EmptyResponse,
            e if e.is_transient() => FailureKind::TransientProvider,
            _ => FailureKind::PermanentProvider,
        }
    }
}
