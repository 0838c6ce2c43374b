//! Application-facing entry point combining cache and router.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::cache::ResponseCache;
use super::client::ResponseStream;
use super::health::ProviderStats;
use super::router::SmartRouter;
use super::types::{LlmRequest, LlmResponse, Provider};
use crate::config::SophiaConfig;
use crate::error::Result;

/// Explicitly constructed LLM context.
///
/// Cheap to clone; clones share the router's health statistics and the cache.
#[derive(Clone)]
pub struct SophiaLlm {
    router: Arc<SmartRouter>,
    cache: Arc<ResponseCache>,
}

impl SophiaLlm {
    pub fn new(router: SmartRouter, cache: ResponseCache) -> Self {
        Self {
            router: Arc::new(router),
            cache: Arc::new(cache),
        }
    }

    /// Build from startup configuration.
    pub fn from_config(config: &SophiaConfig) -> Result<Self> {
        let router = SmartRouter::from_config(config);
        let cache = ResponseCache::from_config(config)?;
        Ok(Self::new(router, cache))
    }

    pub fn router(&self) -> &SmartRouter {
        &self.router
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Generate a response, consulting the cache first when `use_cache`.
    ///
    /// Only responses with a positive cost estimate are cached.
    pub async fn generate(&self, request: &LlmRequest, use_cache: bool) -> Result<LlmResponse> {
        self.cache.connect().await;

        if use_cache {
            if let Some(cached) = self.cache.get(request).await {
                debug!(provider = %cached.provider, "serving cached response");
                return Ok(cached);
            }
        }

        let response = self.router.route_request(request).await?;
        if use_cache && response.cost_estimate > 0.0 {
            self.cache.set(request, &response).await;
        }
        Ok(response)
    }

    /// Stream a response. Never cached.
    pub async fn generate_stream(&self, request: &LlmRequest) -> Result<ResponseStream> {
        self.router.route_stream(request).await
    }

    pub async fn provider_stats(&self) -> HashMap<Provider, ProviderStats> {
        self.router.provider_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::router::testing::{ScriptedClient, ScriptedFactory};
    use crate::llm::router::RoutingConfig;
    use crate::llm::types::{ChatMessage, TaskType};
    use futures::StreamExt;

    fn context(factory: Arc<ScriptedFactory>) -> SophiaLlm {
        let router = SmartRouter::new(factory, RoutingConfig::default());
        SophiaLlm::new(router, ResponseCache::in_memory())
    }

    fn request() -> LlmRequest {
        LlmRequest::new(vec![ChatMessage::user("hello there")], TaskType::Chat)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_vendor() {
        let factory = Arc::new(ScriptedFactory::default().with(ScriptedClient::ok(Provider::OpenAI)));
        let llm = context(factory.clone());

        let first = llm.generate(&request(), true).await.unwrap();
        let second = llm.generate(&request(), true).await.unwrap();

        assert_eq!(factory.client(Provider::OpenAI).calls(), 1);
        assert_eq!(second.content, first.content);
        let stats = llm.cache().get_stats().await;
        assert_eq!(stats.hits, 1);
        assert!(stats.connected);
    }

    #[tokio::test]
    async fn test_prepopulated_cache_is_served_verbatim() {
        let factory = Arc::new(ScriptedFactory::default().with(ScriptedClient::ok(Provider::OpenAI)));
        let llm = context(factory.clone());

        let mut cached = LlmResponse::new(Provider::Anthropic, "claude", "cached answer");
        cached.cost_estimate = 0.01;
        llm.cache().set(&request(), &cached).await;

        let response = llm.generate(&request(), true).await.unwrap();
        assert_eq!(response.content, "cached answer");
        assert_eq!(factory.client(Provider::OpenAI).calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_cost_responses_are_not_cached() {
        let mut free = ScriptedClient::ok(Provider::OpenAI);
        free.cost = 0.0;
        let factory = Arc::new(ScriptedFactory::default().with(free));
        let llm = context(factory.clone());

        llm.generate(&request(), true).await.unwrap();
        llm.generate(&request(), true).await.unwrap();
        assert_eq!(factory.client(Provider::OpenAI).calls(), 2);
    }

    #[tokio::test]
    async fn test_use_cache_false_bypasses_cache() {
        let factory = Arc::new(ScriptedFactory::default().with(ScriptedClient::ok(Provider::OpenAI)));
        let llm = context(factory.clone());

        llm.generate(&request(), false).await.unwrap();
        llm.generate(&request(), false).await.unwrap();
        assert_eq!(factory.client(Provider::OpenAI).calls(), 2);
        assert_eq!(llm.cache().get_stats().await.total_requests, 0);
    }

    #[tokio::test]
    async fn test_generate_stream_forwards_chunks() {
        let factory = Arc::new(ScriptedFactory::default().with(ScriptedClient::ok(Provider::OpenAI)));
        let llm = context(factory);

        let text: String = llm
            .generate_stream(&request().with_stream(true))
            .await
            .unwrap()
            .map(|c| c.unwrap().content)
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(text, "Hello world");
        assert_eq!(llm.cache().get_stats().await.total_requests, 0);
    }
}
