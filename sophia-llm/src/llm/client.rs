//! Provider client trait, client factory and shared HTTP/stream plumbing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::anthropic::AnthropicClient;
use super::openai::OpenAICompatibleClient;
use super::pricing::{PricingCatalog, PricingTable};
use super::retry::RetryPolicy;
use super::sse::{SseDecoder, SseEvent};
use super::types::{LlmRequest, LlmResponse, Provider, TokenUsage};
use crate::config::ProviderSettings;
use crate::error::{Error, Result};

/// Finite, non-restartable sequence of response chunks: zero or more
/// content-only chunks followed by exactly one terminal chunk that
/// carries usage and cost.
pub type ResponseStream = BoxStream<'static, Result<LlmResponse>>;

/// Uniform contract every vendor adapter implements.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider served by this client.
    fn provider(&self) -> Provider;

    /// One round-trip generation, with client-level retries.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Open a streaming generation. Retries apply to opening the stream only.
    async fn generate_stream(&self, request: &LlmRequest) -> Result<ResponseStream>;

    /// Model identifiers offered by the vendor.
    async fn get_models(&self) -> Result<Vec<String>>;

    /// Minimal low-cost vendor call; `true` if it succeeded.
    async fn health_check(&self) -> bool;
}

/// Builds short-lived clients for the router.
pub trait ClientFactory: Send + Sync {
    /// Providers this factory can build clients for.
    fn known_providers(&self) -> Vec<Provider>;

    /// Build a fresh client. Not pooled.
    fn create(&self, provider: Provider) -> Result<Arc<dyn ProviderClient>>;
}

/// Factory building reqwest-backed clients from provider settings.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    settings: HashMap<Provider, ProviderSettings>,
    pricing: PricingCatalog,
    retry: RetryPolicy,
}

impl HttpClientFactory {
    pub fn new(settings: HashMap<Provider, ProviderSettings>) -> Self {
        Self {
            settings,
            pricing: PricingCatalog::builtin(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingCatalog) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl ClientFactory for HttpClientFactory {
    fn known_providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self
            .settings
            .iter()
            .filter(|(_, s)| s.api_key.is_some())
            .map(|(p, _)| *p)
            .collect();
        providers.sort();
        providers
    }

    fn create(&self, provider: Provider) -> Result<Arc<dyn ProviderClient>> {
        let settings = self
            .settings
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::Config(format!("No settings for provider: {}", provider)))?;
        let pricing = self.pricing.table(provider);

        let client: Arc<dyn ProviderClient> = if provider.is_openai_compatible() {
            Arc::new(OpenAICompatibleClient::new(settings, pricing, self.retry.clone())?)
        } else {
            Arc::new(AnthropicClient::new(settings, pricing, self.retry.clone())?)
        };
        Ok(client)
    }
}

pub(crate) fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Pick the model a client should call for `request`.
///
/// The requested model is honored when the request targets this provider
/// explicitly or the model is one this provider prices; otherwise the
/// provider's configured model is used (e.g. after a fallback).
pub(crate) fn resolve_model(
    provider: Provider,
    settings: &ProviderSettings,
    pricing: &PricingTable,
    request: &LlmRequest,
) -> String {
    let requested = request.config.model.as_str();
    if request.config.provider == Some(provider) || pricing.recognizes(requested) {
        requested.to_string()
    } else {
        settings.model.clone()
    }
}

/// Resolve the API key, honoring a request override aimed at this provider.
pub(crate) fn resolve_api_key(
    provider: Provider,
    settings: &ProviderSettings,
    request: &LlmRequest,
) -> Result<String> {
    let override_key = (request.config.provider == Some(provider))
        .then(|| request.config.api_key.clone())
        .flatten();
    override_key
        .or_else(|| settings.api_key.clone())
        .ok_or_else(|| Error::Config(format!("No API key configured for {}", provider)))
}

/// Resolve the base URL, honoring a request override aimed at this provider.
pub(crate) fn resolve_base_url(
    provider: Provider,
    settings: &ProviderSettings,
    request: &LlmRequest,
) -> String {
    let base = (request.config.provider == Some(provider))
        .then(|| request.config.base_url.clone())
        .flatten()
        .unwrap_or_else(|| settings.base_url.clone());
    base.trim_end_matches('/').to_string()
}

#[derive(Debug, Deserialize)]
struct VendorError {
    error: VendorErrorDetail,
}

#[derive(Debug, Deserialize)]
struct VendorErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

/// Map a transport error into the crate taxonomy.
pub(crate) fn map_send_error(provider: Provider, error: reqwest::Error, timeout_secs: u64) -> Error {
    if error.is_timeout() {
        Error::timeout(timeout_secs * 1000)
    } else {
        Error::connection(provider.to_string(), error.to_string())
    }
}

/// Turn a non-success HTTP response into an error; pass successes through.
pub(crate) async fn check_status(
    provider: Provider,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::rate_limited(provider.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<VendorError>(&body) {
        Ok(error) => match error.error.error_type {
            Some(kind) => format!("{} ({}): {}", status, kind, error.error.message),
            None => format!("{}: {}", status, error.error.message),
        },
        Err(_) => format!("{}: {}", status, body),
    };
    Err(Error::llm_api(provider.to_string(), message))
}

/// Incremental output parsed from one vendor stream event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamDelta {
    Text(String),
    Finish(String),
}

struct SseState<P> {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamDelta>>,
    done: bool,
    provider: Provider,
    parse: P,
}

impl<P> SseState<P>
where
    P: Fn(&str) -> Result<Vec<StreamDelta>>,
{
    fn handle(&mut self, event: SseEvent) {
        if self.done {
            return;
        }
        match event {
            SseEvent::Done => self.done = true,
            SseEvent::Data(data) => match (self.parse)(&data) {
                Ok(deltas) => self.pending.extend(deltas.into_iter().map(Ok)),
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.done = true;
                }
            },
        }
    }
}

/// Decode a server-sent-event HTTP body into vendor deltas.
pub(crate) fn sse_deltas<P>(
    provider: Provider,
    response: reqwest::Response,
    parse: P,
) -> BoxStream<'static, Result<StreamDelta>>
where
    P: Fn(&str) -> Result<Vec<StreamDelta>> + Send + 'static,
{
    let state = SseState {
        bytes: response.bytes_stream().boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
        provider,
        parse,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for event in state.decoder.push(&chunk) {
                        state.handle(event);
                    }
                }
                Some(Err(e)) => {
                    let error = Error::connection(state.provider.to_string(), e.to_string());
                    state.pending.push_back(Err(error));
                    state.done = true;
                }
                None => {
                    if let Some(event) = state.decoder.finish() {
                        state.handle(event);
                    }
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}

struct ChunkState {
    deltas: BoxStream<'static, Result<StreamDelta>>,
    provider: Provider,
    model: String,
    pricing: PricingTable,
    prompt_tokens: u64,
    started: Instant,
    content: String,
    finish_reason: Option<String>,
}

impl ChunkState {
    fn chunk(&self, text: String) -> LlmResponse {
        let mut response = LlmResponse::new(self.provider, self.model.clone(), text);
        response.latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        response
    }

    fn final_chunk(self) -> LlmResponse {
        // Approximate usage: chars / 4, not exact tokenization
        let usage = TokenUsage::new(self.prompt_tokens, (self.content.len() / 4) as u64);
        let mut response = LlmResponse::new(self.provider, self.model.clone(), "");
        response.cost_estimate = self.pricing.estimate_cost(&self.model, &usage);
        response.usage = Some(usage);
        response.finish_reason = Some(self.finish_reason.unwrap_or_else(|| "stop".to_string()));
        response.latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        response
    }
}

/// Shape vendor deltas into content chunks plus one terminal usage chunk.
pub(crate) fn response_stream(
    deltas: BoxStream<'static, Result<StreamDelta>>,
    provider: Provider,
    model: String,
    pricing: PricingTable,
    request: &LlmRequest,
    started: Instant,
) -> ResponseStream {
    let state = ChunkState {
        deltas,
        provider,
        model,
        pricing,
        prompt_tokens: request.approx_prompt_tokens(),
        started,
        content: String::new(),
        finish_reason: None,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            match state.deltas.next().await {
                Some(Ok(StreamDelta::Text(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    state.content.push_str(&text);
                    let chunk = state.chunk(text);
                    return Some((Ok(chunk), Some(state)));
                }
                Some(Ok(StreamDelta::Finish(reason))) => state.finish_reason = Some(reason),
                Some(Err(e)) => return Some((Err(e), None)),
                None => return Some((Ok(state.final_chunk()), None)),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ChatMessage, TaskType};

    fn settings(provider: Provider) -> ProviderSettings {
        ProviderSettings::new(provider).with_api_key("test-key")
    }

    #[test]
    fn test_resolve_model_keeps_vendor_models() {
        let request = LlmRequest::new(vec![ChatMessage::user("hi")], TaskType::Chat)
            .with_model("gpt-4o-mini");

        let openai = settings(Provider::OpenAI);
        let table = PricingTable::builtin(Provider::OpenAI);
        assert_eq!(
            resolve_model(Provider::OpenAI, &openai, &table, &request),
            "gpt-4o-mini"
        );

        // Falling back to Anthropic must not send an OpenAI model name
        let anthropic = settings(Provider::Anthropic);
        let table = PricingTable::builtin(Provider::Anthropic);
        assert_eq!(
            resolve_model(Provider::Anthropic, &anthropic, &table, &request),
            anthropic.model
        );
    }

    #[test]
    fn test_resolve_overrides_only_for_targeted_provider() {
        let mut request = LlmRequest::new(vec![ChatMessage::user("hi")], TaskType::Chat)
            .with_provider(Provider::Groq);
        request.config.api_key = Some("override".to_string());
        request.config.base_url = Some("http://localhost:9000/".to_string());

        let groq = settings(Provider::Groq);
        assert_eq!(resolve_api_key(Provider::Groq, &groq, &request).unwrap(), "override");
        assert_eq!(
            resolve_base_url(Provider::Groq, &groq, &request),
            "http://localhost:9000"
        );

        let openai = settings(Provider::OpenAI);
        assert_eq!(resolve_api_key(Provider::OpenAI, &openai, &request).unwrap(), "test-key");
        assert_eq!(
            resolve_base_url(Provider::OpenAI, &openai, &request),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let request = LlmRequest::new(vec![ChatMessage::user("hi")], TaskType::Chat);
        let bare = ProviderSettings::new(Provider::Mistral);
        assert!(matches!(
            resolve_api_key(Provider::Mistral, &bare, &request),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_factory_knows_only_keyed_providers() {
        let mut map = HashMap::new();
        map.insert(Provider::OpenAI, settings(Provider::OpenAI));
        map.insert(Provider::Groq, ProviderSettings::new(Provider::Groq));
        map.insert(Provider::Anthropic, settings(Provider::Anthropic));
        let factory = HttpClientFactory::new(map);

        assert_eq!(
            factory.known_providers(),
            vec![Provider::OpenAI, Provider::Anthropic]
        );
        assert_eq!(
            factory.create(Provider::Anthropic).unwrap().provider(),
            Provider::Anthropic
        );
        assert!(factory.create(Provider::Venice).is_err());
    }

    #[tokio::test]
    async fn test_response_stream_shape() {
        let deltas = stream::iter(vec![
            Ok(StreamDelta::Text("Hel".to_string())),
            Ok(StreamDelta::Text(String::new())),
            Ok(StreamDelta::Text("lo".to_string())),
            Ok(StreamDelta::Finish("length".to_string())),
        ])
        .boxed();
        let request = LlmRequest::new(vec![ChatMessage::user("hi")], TaskType::Chat);

        let chunks: Vec<_> = response_stream(
            deltas,
            Provider::OpenAI,
            "gpt-4o".to_string(),
            PricingTable::builtin(Provider::OpenAI),
            &request,
            Instant::now(),
        )
        .collect()
        .await;

        assert_eq!(chunks.len(), 3);
        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.content, "Hel");
        assert!(first.usage.is_none());
        assert_eq!(chunks[1].as_ref().unwrap().content, "lo");

        let last = chunks[2].as_ref().unwrap();
        assert!(last.is_final_chunk());
        assert_eq!(last.content, "");
        assert_eq!(last.finish_reason.as_deref(), Some("length"));
        assert_eq!(last.usage.unwrap().prompt_tokens, request.approx_prompt_tokens());
        assert!(last.cost_estimate > 0.0);
    }

    #[tokio::test]
    async fn test_response_stream_stops_on_error() {
        let deltas = stream::iter(vec![
            Ok(StreamDelta::Text("partial".to_string())),
            Err(Error::connection("openai", "reset")),
            Ok(StreamDelta::Text("never".to_string())),
        ])
        .boxed();
        let request = LlmRequest::new(vec![ChatMessage::user("hi")], TaskType::Chat);

        let chunks: Vec<_> = response_stream(
            deltas,
            Provider::OpenAI,
            "gpt-4o".to_string(),
            PricingTable::builtin(Provider::OpenAI),
            &request,
            Instant::now(),
        )
        .collect()
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(chunks[1].is_err());
    }
}
