//! Anthropic Messages API client.

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
use super::types::{ChatMessage, ChatRole, LlmRequest, LlmResponse, Provider, TokenUsage};
use crate::config::ProviderSettings;
use crate::error::{Error, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic client.
pub struct AnthropicClient {
    settings: ProviderSettings,
    pricing: PricingTable,
    retry: RetryPolicy,
    http: Client,
}

// Anthropic API types
#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct CountTokensRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta { delta: MessageDeltaBody },
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

impl AnthropicClient {
    pub fn new(settings: ProviderSettings, pricing: PricingTable, retry: RetryPolicy) -> Result<Self> {
        let http = build_http_client(settings.timeout_secs)?;
        Ok(Self {
            settings,
            pricing,
            retry,
            http,
        })
    }

    /// Split system messages out; Anthropic takes them as a top-level field.
    fn format_messages<'a>(&self, messages: &'a [ChatMessage]) -> (Option<String>, Vec<WireMessage<'a>>) {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();

        let wire = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();

        let system = if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        };
        (system, wire)
    }

    async fn post(
        &self,
        request: &LlmRequest,
        path: &str,
        body: &impl Serialize,
        timeout_secs: u64,
    ) -> Result<reqwest::Response> {
        let provider = Provider::Anthropic;
        let api_key = resolve_api_key(provider, &self.settings, request)?;
        let url = format!("{}{}", resolve_base_url(provider, &self.settings, request), path);

        let response = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(Duration::from_secs(timeout_secs))
            .json(body)
            .send()
            .await
            .map_err(|e| map_send_error(provider, e, timeout_secs))?;

        check_status(provider, response).await
    }

    async fn send_messages(&self, request: &LlmRequest, model: &str, stream: bool) -> Result<reqwest::Response> {
        let (system, messages) = self.format_messages(&request.messages);
        let body = MessagesRequest {
            model,
            messages,
            system,
            max_tokens: request.config.max_tokens,
            temperature: request.config.temperature,
            stream,
        };
        self.post(request, "/v1/messages", &body, request.config.timeout_secs)
            .await
    }

    async fn generate_once(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let model = resolve_model(Provider::Anthropic, &self.settings, &self.pricing, request);
        let started = Instant::now();

        let response = self.send_messages(request, &model, false).await?;
        let body: MessagesResponse = response.json().await.map_err(|e| {
            Error::llm_api("anthropic", format!("Failed to parse response: {}", e))
        })?;

        let content: String = body
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();

        let usage = TokenUsage::new(body.usage.input_tokens, body.usage.output_tokens);
        let served_model = body.model.unwrap_or(model);

        let mut result = LlmResponse::new(Provider::Anthropic, served_model, content);
        result.cost_estimate = self.pricing.estimate_cost(&result.model, &usage);
        result.usage = Some(usage);
        result.finish_reason = body.stop_reason;
        result.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    async fn open_stream(&self, request: &LlmRequest) -> Result<ResponseStream> {
        let model = resolve_model(Provider::Anthropic, &self.settings, &self.pricing, request);
        let started = Instant::now();
        let response = self.send_messages(request, &model, true).await?;

        let deltas = sse_deltas(Provider::Anthropic, response, parse_event);
        Ok(response_stream(
            deltas,
            Provider::Anthropic,
            model,
            self.pricing.clone(),
            request,
            started,
        ))
    }
}

fn parse_event(data: &str) -> Result<Vec<StreamDelta>> {
    let event: StreamEvent = serde_json::from_str(data).map_err(|e| {
        Error::llm_api("anthropic", format!("Failed to parse stream event: {}", e))
    })?;

    match event {
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } => Ok(vec![StreamDelta::Text(text)]),
        StreamEvent::MessageDelta { delta } => {
            Ok(delta.stop_reason.map(StreamDelta::Finish).into_iter().collect())
        }
        StreamEvent::Error { error } => Err(Error::llm_api("anthropic", error.message)),
        _ => Ok(Vec::new()),
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.retry
            .run(Provider::Anthropic, || self.generate_once(request))
            .await
    }

    async fn generate_stream(&self, request: &LlmRequest) -> Result<ResponseStream> {
        self.retry
            .run(Provider::Anthropic, || self.open_stream(request))
            .await
    }

    async fn get_models(&self) -> Result<Vec<String>> {
        // No listing endpoint in the pinned API version
        Ok(self
            .pricing
            .models
            .keys()
            .filter(|m| !self.pricing.prefix_models.contains(*m))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> bool {
        if self.settings.api_key.is_none() {
            return false;
        }

        // Token counting is free and exercises auth end to end
        let probe = LlmRequest::new(
            vec![ChatMessage::user("ping")],
            super::types::TaskType::Chat,
        );
        let body = CountTokensRequest {
            model: &self.settings.model,
            messages: vec![WireMessage {
                role: "user",
                content: "ping",
            }],
        };

        match self
            .post(&probe, "/v1/messages/count_tokens", &body, self.settings.timeout_secs)
            .await
        {
            Ok(_) => {
                debug!(provider = "anthropic", "health check passed");
                true
            }
            Err(e) => {
                warn!(provider = "anthropic", error = %e, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::TaskType;
    use futures::StreamExt;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer) -> AnthropicClient {
        let settings = ProviderSettings::new(Provider::Anthropic)
            .with_api_key("test-key")
            .with_base_url(server.base_url());
        AnthropicClient::new(
            settings,
            PricingTable::builtin(Provider::Anthropic),
            RetryPolicy::none(),
        )
        .unwrap()
    }

    fn request() -> LlmRequest {
        LlmRequest::new(
            vec![
                ChatMessage::system("You are terse."),
                ChatMessage::system("Answer in English."),
                ChatMessage::user("hi"),
            ],
            TaskType::Chat,
        )
        .with_provider(Provider::Anthropic)
        .with_model("claude-3-5-sonnet-20241022")
        .with_max_tokens(128)
        .with_temperature(0.2)
    }

    #[test]
    fn test_system_messages_become_system_field() {
        let server = MockServer::start();
        let client = client_for(&server);
        let req = request();
        let (system, messages) = client.format_messages(&req.messages);

        assert_eq!(system.as_deref(), Some("You are terse.\n\nAnswer in English."));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn test_generate_parses_messages_response() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header("x-api-key", "test-key")
                .header("anthropic-version", "2023-06-01")
                .json_body(json!({
                    "model": "claude-3-5-sonnet-20241022",
                    "messages": [{"role": "user", "content": "hi"}],
                    "system": "You are terse.\n\nAnswer in English.",
                    "max_tokens": 128,
                    "temperature": 0.2
                }));
            then.status(200).json_body(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet-20241022",
                "content": [{"type": "text", "text": "Hello."}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1000, "output_tokens": 1000}
            }));
        });

        let client = client_for(&server);
        let response = client.generate(&request()).await.unwrap();

        mock.assert();
        assert_eq!(response.content, "Hello.");
        assert_eq!(response.provider, Provider::Anthropic);
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage, Some(TokenUsage::new(1000, 1000)));
        // 1000 * 3/1M + 1000 * 15/1M
        assert!((response.cost_estimate - 0.018).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stream_text_deltas_and_stop_reason() {
        let server = MockServer::start();
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi \"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"there\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n"
        );
        server.mock(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .json_body_partial(r#"{"stream": true}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        });

        let client = client_for(&server);
        let chunks: Vec<_> = client
            .generate_stream(&request().with_stream(true))
            .await
            .unwrap()
            .collect()
            .await;

        let contents: Vec<_> = chunks
            .iter()
            .map(|c| c.as_ref().unwrap().content.clone())
            .collect();
        assert_eq!(contents, vec!["Hi ", "there", ""]);
        let last = chunks.last().unwrap().as_ref().unwrap();
        assert!(last.is_final_chunk());
        assert_eq!(last.finish_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn test_stream_error_event_ends_stream() {
        let server = MockServer::start();
        let body = concat!(
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"partial\"}}\n\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"never\"}}\n\n"
        );
        server.mock(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200).body(body);
        });

        let client = client_for(&server);
        let chunks: Vec<_> = client
            .generate_stream(&request().with_stream(true))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().content, "partial");
        assert!(chunks[1].as_ref().unwrap_err().to_string().contains("Overloaded"));
    }

    #[tokio::test]
    async fn test_health_check_uses_count_tokens() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/messages/count_tokens");
            then.status(200).json_body(json!({"input_tokens": 3}));
        });

        let client = client_for(&server);
        assert!(client.health_check().await);
        mock.assert();
    }

    #[tokio::test]
    async fn test_health_check_false_without_key() {
        let settings = ProviderSettings::new(Provider::Anthropic);
        let client = AnthropicClient::new(
            settings,
            PricingTable::builtin(Provider::Anthropic),
            RetryPolicy::none(),
        )
        .unwrap();
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn test_static_model_list() {
        let server = MockServer::start();
        let models = client_for(&server).get_models().await.unwrap();
        assert!(models.contains(&"claude-3-5-sonnet-20241022".to_string()));
        assert!(!models.contains(&"claude-3-opus".to_string()));
    }
}
