//! # sophia-llm
//!
//! Smart routing and fallback across LLM vendors, with response caching.
//!
//! ## Core Components
//!
//! - **Clients**: One [`llm::ProviderClient`] per vendor, with bounded retries
//! - **Router**: Task-aware provider selection from live health and rolling stats
//! - **Cache**: Response cache keyed on the request's semantic content
//! - **Facade**: [`SophiaLlm`], an explicitly constructed context tying them together
//!
//! ## Example
//!
//! ```rust,ignore
//! use sophia_llm::{ChatMessage, LlmRequest, SophiaConfig, SophiaLlm, TaskType};
//!
//! let config = SophiaConfig::from_env()?;
//! let llm = SophiaLlm::from_config(&config)?;
//!
//! let request = LlmRequest::new(vec![ChatMessage::user("Explain borrowing")], TaskType::Chat);
//! let response = llm.generate(&request, true).await?;
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod secrets;

// Re-exports for convenience
pub use config::{ProviderSettings, SophiaConfig};
pub use error::{Error, Result};
pub use llm::{
    ChatMessage, ChatRole, LlmRequest, LlmResponse, Provider, ProviderClient, ResponseCache,
    RoutingConfig, SmartRouter, SophiaLlm, TaskType, TokenUsage,
};
pub use secrets::{EnvSecretStore, SecretStore, StaticSecretStore};
