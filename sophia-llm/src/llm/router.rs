//! Smart router for task-aware provider selection.
//!
//! Routes requests to providers based on:
//! - Task type priority tables
//! - Observed success rate and latency
//! - Live provider health
//!
//! Failed requests fall back through an ordered provider list. Client-level
//! retries happen first, inside each [`ProviderClient`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{ClientFactory, HttpClientFactory, ProviderClient, ResponseStream};
use super::health::{ProviderHealthTracker, ProviderStats};
use super::types::{LlmRequest, LlmResponse, Provider, TaskType};
use crate::config::SophiaConfig;
use crate::error::{Error, Result};

/// Static routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Per task type, provider priority (higher wins)
    pub provider_priorities: HashMap<TaskType, HashMap<Provider, u32>>,
    /// Maximum acceptable cost per request in USD (not used in scoring)
    pub max_cost_threshold: f64,
    /// Maximum acceptable latency in milliseconds (not used in scoring)
    pub max_latency_threshold: f64,
    /// Tried in order when the selected provider fails
    pub fallback_providers: Vec<Provider>,
    /// Last resort when nothing is healthy
    pub default_provider: Provider,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        use Provider::*;

        let table = |rows: &[(Provider, u32)]| rows.iter().copied().collect::<HashMap<_, _>>();
        let mut provider_priorities = HashMap::new();
        provider_priorities.insert(
            TaskType::Coding,
            table(&[(Anthropic, 10), (OpenAI, 9), (DeepSeek, 8), (Mistral, 6), (Groq, 5)]),
        );
        provider_priorities.insert(
            TaskType::Research,
            table(&[(Perplexity, 10), (OpenAI, 8), (Anthropic, 7), (Xai, 6)]),
        );
        provider_priorities.insert(
            TaskType::Analysis,
            table(&[(Anthropic, 10), (OpenAI, 9), (Mistral, 6), (DeepSeek, 5)]),
        );
        provider_priorities.insert(
            TaskType::Creative,
            table(&[(OpenAI, 10), (Anthropic, 9), (Xai, 7), (Venice, 6)]),
        );
        provider_priorities.insert(
            TaskType::Chat,
            table(&[(OpenAI, 10), (Anthropic, 9), (Groq, 8), (Mistral, 7)]),
        );
        provider_priorities.insert(
            TaskType::Reasoning,
            table(&[(OpenAI, 10), (Anthropic, 9), (DeepSeek, 8)]),
        );

        Self {
            provider_priorities,
            max_cost_threshold: 0.10,
            max_latency_threshold: 30_000.0,
            fallback_providers: vec![OpenAI, Anthropic, Groq, Mistral],
            default_provider: OpenAI,
        }
    }
}

impl RoutingConfig {
    /// Replace the priority table for one task type.
    pub fn with_priorities(mut self, task_type: TaskType, priorities: &[(Provider, u32)]) -> Self {
        self.provider_priorities
            .insert(task_type, priorities.iter().copied().collect());
        self
    }

    pub fn with_fallback_providers(mut self, providers: Vec<Provider>) -> Self {
        self.fallback_providers = providers;
        self
    }

    pub fn with_default_provider(mut self, provider: Provider) -> Self {
        self.default_provider = provider;
        self
    }
}

/// Provider selector with health tracking and fallback.
pub struct SmartRouter {
    factory: Arc<dyn ClientFactory>,
    config: RoutingConfig,
    health: Arc<RwLock<ProviderHealthTracker>>,
}

impl SmartRouter {
    pub fn new(factory: Arc<dyn ClientFactory>, config: RoutingConfig) -> Self {
        Self {
            factory,
            config,
            health: Arc::new(RwLock::new(ProviderHealthTracker::new())),
        }
    }

    /// Router over HTTP clients for every configured provider.
    pub fn from_config(config: &SophiaConfig) -> Self {
        let factory = HttpClientFactory::new(config.providers.clone())
            .with_pricing(config.pricing.clone())
            .with_retry(config.retry.clone());
        Self::new(Arc::new(factory), config.routing.clone())
    }

    /// Share an existing health tracker.
    pub fn with_health(mut self, health: Arc<RwLock<ProviderHealthTracker>>) -> Self {
        self.health = health;
        self
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Snapshot of per-provider statistics.
    pub async fn provider_stats(&self) -> HashMap<Provider, ProviderStats> {
        self.health.read().await.snapshot()
    }

    /// Providers whose live health check passes. Not cached between calls.
    pub async fn healthy_providers(&self) -> Vec<Provider> {
        let checks = self.factory.known_providers().into_iter().map(|provider| async move {
            match self.factory.create(provider) {
                Ok(client) => client.health_check().await.then_some(provider),
                Err(e) => {
                    warn!(%provider, error = %e, "could not build client for health check");
                    None
                }
            }
        });

        join_all(checks).await.into_iter().flatten().collect()
    }

    /// Pick the provider for `request`.
    pub async fn select_provider(&self, request: &LlmRequest) -> Provider {
        if let Some(provider) = request.config.provider {
            debug!(%provider, "explicit provider override");
            return provider;
        }

        let healthy = self.healthy_providers().await;
        let empty = HashMap::new();
        let priorities = self
            .config
            .provider_priorities
            .get(&request.task_type)
            .unwrap_or(&empty);

        let best = {
            let health = self.health.read().await;
            let mut best: Option<(Provider, f64)> = None;
            for provider in &healthy {
                let Some(&priority) = priorities.get(provider) else {
                    continue;
                };
                let score = priority as f64 * health.get(*provider).health_score();
                if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                    best = Some((*provider, score));
                }
            }
            best
        };

        if let Some((provider, score)) = best {
            info!(%provider, task_type = %request.task_type, score, "selected provider");
            return provider;
        }

        if let Some(provider) = self
            .config
            .fallback_providers
            .iter()
            .copied()
            .find(|p| healthy.contains(p))
        {
            info!(%provider, task_type = %request.task_type, "no scored provider, using fallback");
            return provider;
        }

        let provider = self.config.default_provider;
        warn!(%provider, "no healthy provider, using default");
        provider
    }

    /// Route a request with fallback.
    ///
    /// In streaming mode only the first non-empty chunk is returned; use
    /// [`SmartRouter::route_stream`] for the full sequence.
    pub async fn route_request(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let route_id = Uuid::new_v4();
        let provider = self.select_provider(request).await;
        debug!(%route_id, %provider, stream = request.config.stream, "routing request");

        let error = match self.execute(provider, request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        warn!(%route_id, %provider, error = %error, "provider failed, trying fallbacks");

        for fallback in self.fallbacks_excluding(provider) {
            debug!(%route_id, provider = %fallback, "attempting fallback");
            match self.execute(fallback, request).await {
                Ok(response) => {
                    info!(%route_id, provider = %fallback, "fallback succeeded");
                    return Ok(response);
                }
                Err(e) => warn!(%route_id, provider = %fallback, error = %e, "fallback failed"),
            }
        }

        Err(Error::AllProvidersFailed {
            original: error.to_string(),
        })
    }

    /// Open a full response stream with fallback.
    ///
    /// Falls back only if the stream fails before its first chunk.
    pub async fn route_stream(&self, request: &LlmRequest) -> Result<ResponseStream> {
        let route_id = Uuid::new_v4();
        let provider = self.select_provider(request).await;
        debug!(%route_id, %provider, "routing stream");

        let error = match self.open_stream(provider, request).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        warn!(%route_id, %provider, error = %error, "stream failed to start, trying fallbacks");

        for fallback in self.fallbacks_excluding(provider) {
            match self.open_stream(fallback, request).await {
                Ok(stream) => {
                    info!(%route_id, provider = %fallback, "fallback stream started");
                    return Ok(stream);
                }
                Err(e) => warn!(%route_id, provider = %fallback, error = %e, "fallback stream failed"),
            }
        }

        Err(Error::AllProvidersFailed {
            original: error.to_string(),
        })
    }

    fn fallbacks_excluding(&self, failed: Provider) -> Vec<Provider> {
        self.config
            .fallback_providers
            .iter()
            .copied()
            .filter(|p| *p != failed)
            .collect()
    }

    async fn execute(&self, provider: Provider, request: &LlmRequest) -> Result<LlmResponse> {
        let result = match self.factory.create(provider) {
            Ok(client) => self.call(client.as_ref(), request).await,
            Err(e) => Err(e),
        };

        let mut health = self.health.write().await;
        match &result {
            Ok(response) if !request.config.stream => {
                health.record_success(provider, response.latency_ms, response.cost_estimate)
            }
            Ok(_) => {}
            Err(_) => health.record_failure(provider),
        }
        result
    }

    async fn call(&self, client: &dyn ProviderClient, request: &LlmRequest) -> Result<LlmResponse> {
        if !request.config.stream {
            return client.generate(request).await;
        }

        let mut stream = client.generate_stream(request).await?;
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.content.is_empty() {
                return Ok(chunk);
            }
            last = Some(chunk);
        }
        last.ok_or_else(|| {
            Error::llm_api(client.provider().to_string(), "Stream ended without a response")
        })
    }

    async fn open_stream(&self, provider: Provider, request: &LlmRequest) -> Result<ResponseStream> {
        let started = Instant::now();
        let opened = match self.factory.create(provider) {
            Ok(client) => client.generate_stream(request).await,
            Err(e) => Err(e),
        };

        let first = match opened {
            Ok(mut stream) => match stream.next().await {
                Some(Ok(chunk)) => Ok((chunk, stream)),
                Some(Err(e)) => Err(e),
                None => Err(Error::llm_api(
                    provider.to_string(),
                    "Stream ended without a response",
                )),
            },
            Err(e) => Err(e),
        };

        match first {
            Ok((chunk, rest)) => {
                debug!(
                    %provider,
                    first_chunk_ms = started.elapsed().as_millis() as u64,
                    "stream started"
                );
                Ok(stream::once(async move { Ok(chunk) }).chain(rest).boxed())
            }
            Err(e) => {
                self.health.write().await.record_failure(provider);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted clients shared by router and facade tests.

    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct ScriptedClient {
        pub provider: Provider,
        pub healthy: bool,
        pub fail: bool,
        pub latency_ms: f64,
        pub cost: f64,
        pub chunks: Vec<&'static str>,
        pub calls: AtomicUsize,
    }

    impl ScriptedClient {
        pub fn ok(provider: Provider) -> Self {
            Self {
                provider,
                healthy: true,
                fail: false,
                latency_ms: 100.0,
                cost: 0.002,
                chunks: vec!["", "Hello", " world"],
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(provider: Provider) -> Self {
            Self {
                fail: true,
                ..Self::ok(provider)
            }
        }

        pub fn unhealthy(provider: Provider) -> Self {
            Self {
                healthy: false,
                ..Self::ok(provider)
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn failure(&self) -> Error {
            Error::MaxRetriesExceeded {
                provider: self.provider.to_string(),
                attempts: 3,
                last_error: format!("{} is down", self.provider),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(self.failure());
            }
            let mut response =
                LlmResponse::new(self.provider, "scripted", format!("from {}", self.provider));
            response.latency_ms = self.latency_ms;
            response.cost_estimate = self.cost;
            Ok(response)
        }

        async fn generate_stream(&self, _request: &LlmRequest) -> Result<ResponseStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(self.failure());
            }
            let provider = self.provider;
            let chunks: Vec<Result<LlmResponse>> = self
                .chunks
                .iter()
                .map(|c| Ok(LlmResponse::new(provider, "scripted", *c)))
                .collect();
            Ok(stream::iter(chunks).boxed())
        }

        async fn get_models(&self) -> Result<Vec<String>> {
            Ok(vec!["scripted".to_string()])
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }
    }

    #[derive(Default)]
    pub struct ScriptedFactory {
        pub clients: HashMap<Provider, Arc<ScriptedClient>>,
    }

    impl ScriptedFactory {
        pub fn with(mut self, client: ScriptedClient) -> Self {
            self.clients.insert(client.provider, Arc::new(client));
            self
        }

        pub fn client(&self, provider: Provider) -> Arc<ScriptedClient> {
            self.clients[&provider].clone()
        }
    }

    impl ClientFactory for ScriptedFactory {
        fn known_providers(&self) -> Vec<Provider> {
            let mut providers: Vec<_> = self.clients.keys().copied().collect();
            providers.sort();
            providers
        }

        fn create(&self, provider: Provider) -> Result<Arc<dyn ProviderClient>> {
            self.clients
                .get(&provider)
                .map(|c| c.clone() as Arc<dyn ProviderClient>)
                .ok_or_else(|| Error::Config(format!("No settings for provider: {}", provider)))
        }
    }
}
