//! Client for vendors speaking the OpenAI chat-completions dialect.
//!
//! Serves OpenAI, OpenRouter, Perplexity, xAI, Groq, Mistral, DeepSeek,
//! TogetherAI and Venice; only base URL, default model and pricing differ.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::{
    build_http_client, check_status, map_send_error, resolve_api_key, resolve_base_url,
    resolve_model, response_stream, sse_deltas, ProviderClient, ResponseStream, StreamDelta,
};
use super::pricing::PricingTable;
use super::retry::RetryPolicy;
use super::types::{ChatMessage, LlmRequest, LlmResponse, Provider, TokenUsage};
use crate::config::ProviderSettings;
use crate::error::{Error, Result};

/// OpenAI-compatible chat-completions client.
pub struct OpenAICompatibleClient {
    provider: Provider,
    settings: ProviderSettings,
    pricing: PricingTable,
    retry: RetryPolicy,
    http: Client,
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAICompatibleClient {
    pub fn new(settings: ProviderSettings, pricing: PricingTable, retry: RetryPolicy) -> Result<Self> {
        let http = build_http_client(settings.timeout_secs)?;
        Ok(Self {
            provider: settings.provider,
            settings,
            pricing,
            retry,
            http,
        })
    }

    /// Vendors without a model-listing endpoint.
    fn lists_models(&self) -> bool {
        !matches!(self.provider, Provider::Perplexity)
    }

    fn format_messages<'a>(&self, messages: &'a [ChatMessage]) -> Vec<WireMessage<'a>> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect()
    }

    async fn send(&self, request: &LlmRequest, model: &str, stream: bool) -> Result<reqwest::Response> {
        let api_key = resolve_api_key(self.provider, &self.settings, request)?;
        let url = format!(
            "{}/chat/completions",
            resolve_base_url(self.provider, &self.settings, request)
        );
        let body = ChatCompletionRequest {
            model,
            messages: self.format_messages(&request.messages),
            temperature: request.config.temperature,
            max_tokens: request.config.max_tokens,
            stream,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(request.config.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(self.provider, e, request.config.timeout_secs))?;

        check_status(self.provider, response).await
    }

    async fn generate_once(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let model = resolve_model(self.provider, &self.settings, &self.pricing, request);
        let started = Instant::now();

        let response = self.send(request, &model, false).await?;
        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            Error::llm_api(self.provider.to_string(), format!("Failed to parse response: {}", e))
        })?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm_api(self.provider.to_string(), "No choices in response"))?;

        let usage = body
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        let served_model = body.model.unwrap_or(model);
        let cost = usage
            .map(|u| self.pricing.estimate_cost(&served_model, &u))
            .unwrap_or(0.0);

        let mut result = LlmResponse::new(
            self.provider,
            served_model,
            choice.message.content.unwrap_or_default(),
        );
        result.usage = usage;
        result.finish_reason = choice.finish_reason;
        result.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        result.cost_estimate = cost;
        Ok(result)
    }

    async fn open_stream(&self, request: &LlmRequest) -> Result<ResponseStream> {
        let model = resolve_model(self.provider, &self.settings, &self.pricing, request);
        let started = Instant::now();
        let response = self.send(request, &model, true).await?;

        let provider = self.provider;
        let deltas = sse_deltas(provider, response, move |data| parse_chunk(provider, data));
        Ok(response_stream(
            deltas,
            provider,
            model,
            self.pricing.clone(),
            request,
            started,
        ))
    }

    fn static_models(&self) -> Vec<String> {
        self.pricing.models.keys().cloned().collect()
    }
}

fn parse_chunk(provider: Provider, data: &str) -> Result<Vec<StreamDelta>> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data).map_err(|e| {
        Error::llm_api(provider.to_string(), format!("Failed to parse stream chunk: {}", e))
    })?;

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            deltas.push(StreamDelta::Text(text));
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(StreamDelta::Finish(reason));
        }
    }
    Ok(deltas)
}

#[async_trait]
impl ProviderClient for OpenAICompatibleClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.retry
            .run(self.provider, || self.generate_once(request))
            .await
    }

    async fn generate_stream(&self, request: &LlmRequest) -> Result<ResponseStream> {
        self.retry.run(self.provider, || self.open_stream(request)).await
    }

    async fn get_models(&self) -> Result<Vec<String>> {
        if !self.lists_models() {
            return Ok(self.static_models());
        }

        let api_key = self
            .settings
            .api_key
            .clone()
            .ok_or_else(|| Error::Config(format!("No API key configured for {}", self.provider)))?;
        let url = format!("{}/models", self.settings.base_url.trim_end_matches('/'));

        let response = self
            .http
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| map_send_error(self.provider, e, self.settings.timeout_secs))?;
        let response = check_status(self.provider, response).await?;
        let list: ModelList = response.json().await.map_err(|e| {
            Error::llm_api(self.provider.to_string(), format!("Failed to parse models: {}", e))
        })?;

        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn health_check(&self) -> bool {
        if self.settings.api_key.is_none() {
            return false;
        }

        let result = if self.lists_models() {
            self.get_models().await.map(|_| ())
        } else {
            // No listing endpoint: smallest possible completion
            let mut probe = LlmRequest::new(
                vec![ChatMessage::user("ping")],
                super::types::TaskType::Chat,
            )
            .with_provider(self.provider)
            .with_model(self.settings.model.clone())
            .with_max_tokens(1);
            probe.config.timeout_secs = self.settings.timeout_secs;
            self.generate_once(&probe).await.map(|_| ())
        };

        match result {
            Ok(()) => {
                debug!(provider = %self.provider, "health check passed");
                true
            }
            Err(e) => {
                warn!(provider = %self.provider, error = %e, "health check failed");
                false
            }
        }
    }
}
