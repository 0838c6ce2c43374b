//! Error types for sophia-llm.

use thiserror::Error;

/// Result type alias using sophia-llm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing, generating or caching.
#[derive(Error, Debug)]
pub enum Error {
    /// Vendor rejected the call with a rate limit
    #[error("Rate limited by {provider}")]
    RateLimited { provider: String },

    /// Vendor API returned an error response
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// Transport-level failure talking to a vendor
    #[error("Connection error: {provider} - {message}")]
    Connection { provider: String, message: String },

    /// Client-level retries exhausted
    #[error("{provider} failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        provider: String,
        attempts: u32,
        last_error: String,
    },

    /// Every provider in the fallback chain failed
    #[error("All providers failed. Original error: {original}")]
    AllProvidersFailed { original: String },

    /// Cache backing store error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(provider: impl Into<String>) -> Self {
        Self::RateLimited {
            provider: provider.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether the client-level retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. }
                | Error::LlmApi { .. }
                | Error::Connection { .. }
                | Error::Timeout { .. }
        )
    }

    /// Whether this is a vendor rate limit.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::rate_limited("openai").is_retryable());
        assert!(Error::connection("openai", "reset").is_retryable());
        assert!(Error::llm_api("anthropic", "overloaded").is_retryable());
        assert!(Error::timeout(30_000).is_retryable());

        assert!(!Error::Config("missing key".to_string()).is_retryable());
        assert!(!Error::Cache("down".to_string()).is_retryable());
        assert!(!Error::AllProvidersFailed {
            original: "boom".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_all_providers_failed_embeds_original() {
        let err = Error::AllProvidersFailed {
            original: "LLM API error: openai - quota exceeded".to_string(),
        };
        assert!(err.to_string().contains("quota exceeded"));
    }
}
