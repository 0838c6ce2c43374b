//! LLM provider abstraction with smart routing, fallback and caching.
//!
//! This module provides a unified interface over multiple LLM vendors
//! (OpenAI, Anthropic and the OpenAI-compatible family) with routing based on
//! task type, observed provider health, and an ordered fallback chain.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sophia_llm::llm::{ChatMessage, LlmRequest, SophiaLlm};
//! use sophia_llm::SophiaConfig;
//!
//! let config = SophiaConfig::from_env()?;
//! let llm = SophiaLlm::from_config(&config)?;
//!
//! // Task type is classified from the last user message
//! let request = LlmRequest::auto(vec![ChatMessage::user("Refactor this function")]);
//! let response = llm.generate(&request, true).await?;
//! println!("{} via {}", response.content, response.provider);
//! ```

mod anthropic;
mod cache;
mod client;
mod facade;
mod health;
mod openai;
mod pricing;
mod proptest;
mod retry;
mod router;
mod sse;
mod types;

pub use anthropic::AnthropicClient;
#[cfg(feature = "redis")]
pub use cache::RedisStore;
pub use cache::{
    cache_key, CacheReport, CacheStats, CacheStore, CachedResponse, MemoryStore, ResponseCache,
    CACHE_KEY_PREFIX,
};
pub use client::{ClientFactory, HttpClientFactory, ProviderClient, ResponseStream};
pub use facade::SophiaLlm;
pub use health::{ProviderHealthTracker, ProviderStats};
pub use openai::OpenAICompatibleClient;
pub use pricing::{ModelPricing, PricingCatalog, PricingTable};
pub use retry::RetryPolicy;
pub use router::{RoutingConfig, SmartRouter};
pub use sse::{SseDecoder, SseEvent};
pub use types::{
    ChatMessage, ChatRole, LlmRequest, LlmResponse, Provider, RequestConfig, TaskType, TokenUsage,
};
