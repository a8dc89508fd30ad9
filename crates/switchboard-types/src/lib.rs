//! Shared errors and configuration for the Switchboard LLM gateway.
//!
//! This crate provides the foundational types used by the other Switchboard crates:
//! - `GatewayError`: unified error taxonomy
//! - `PlatformKey`: the provider lookup key
//! - `PlatformConfig` / `SystemConfig`: credentials and tunables

mod config;

pub use config::*;

/// Unified error type for all gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // === Construction ===
    #[error("{provider} is not configured: {message}")]
    Configuration { provider: String, message: String },

    #[error("Unknown platform '{0}'")]
    UnknownPlatform(String),

    // === Request shape ===
    #[error("Invalid request: {0}")]
    ValidationError(String),

    #[error("Provider {provider} does not support {operation}")]
    UnsupportedOperation { provider: String, operation: String },

    // === Upstream ===
    #[error("Authentication failed for provider {provider}: {message}")]
    AuthError { provider: String, message: String },

    #[error("Provider {provider} returned HTTP {status}: {message}")]
    UpstreamError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Embedding batch {batch} on {provider} failed after {attempts} attempts: {message}")]
    EmbeddingBatchExhausted {
        provider: String,
        batch: usize,
        attempts: usize,
        message: String,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::UpstreamError { retryable: true, .. })
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GatewayError::Configuration { .. }
                | GatewayError::UnknownPlatform(_)
                | GatewayError::ValidationError(_)
                | GatewayError::UnsupportedOperation { .. }
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::ValidationError(message.into())
    }

    /// Transport-level failure (connect, read, decode) before any HTTP status was seen.
    pub fn transport(provider: impl Into<String>, err: impl std::fmt::Display) -> Self {
        GatewayError::UpstreamError {
            provider: provider.into(),
            status: 0,
            message: err.to_string(),
            retryable: true,
        }
    }
}

/// A convenience alias for `Result<T, GatewayError>`.
pub type Result<T> = std::result::Result<T, GatewayError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
