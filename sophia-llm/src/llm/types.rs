//! LLM types for requests, responses, providers and task classification.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    OpenRouter,
    Perplexity,
    Xai,
    Groq,
    Mistral,
    DeepSeek,
    #[serde(rename = "together_ai")]
    TogetherAI,
    Venice,
}

impl Provider {
    /// Every known provider, in health-check order.
    pub const ALL: [Provider; 10] = [
        Provider::OpenAI,
        Provider::Anthropic,
        Provider::OpenRouter,
        Provider::Perplexity,
        Provider::Xai,
        Provider::Groq,
        Provider::Mistral,
        Provider::DeepSeek,
        Provider::TogetherAI,
        Provider::Venice,
    ];

    /// Stable lowercase identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
            Self::Perplexity => "perplexity",
            Self::Xai => "xai",
            Self::Groq => "groq",
            Self::Mistral => "mistral",
            Self::DeepSeek => "deepseek",
            Self::TogetherAI => "together_ai",
            Self::Venice => "venice",
        }
    }

    /// Prefix used for environment variables (`OPENAI_API_KEY`, `LLM_OPENAI_MODEL`).
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::OpenAI => "OPENAI",
            Self::Anthropic => "ANTHROPIC",
            Self::OpenRouter => "OPENROUTER",
            Self::Perplexity => "PERPLEXITY",
            Self::Xai => "XAI",
            Self::Groq => "GROQ",
            Self::Mistral => "MISTRAL",
            Self::DeepSeek => "DEEPSEEK",
            Self::TogetherAI => "TOGETHER",
            Self::Venice => "VENICE",
        }
    }

    /// Default API base URL.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Perplexity => "https://api.perplexity.ai",
            Self::Xai => "https://api.x.ai/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::Mistral => "https://api.mistral.ai/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::TogetherAI => "https://api.together.xyz/v1",
            Self::Venice => "https://api.venice.ai/api/v1",
        }
    }

    /// Default model when neither the request nor the environment names one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o",
            Self::Anthropic => "claude-3-5-sonnet-20241022",
            Self::OpenRouter => "openai/gpt-4o",
            Self::Perplexity => "llama-3.1-sonar-large-128k-online",
            Self::Xai => "grok-beta",
            Self::Groq => "llama-3.1-70b-versatile",
            Self::Mistral => "mistral-large-latest",
            Self::DeepSeek => "deepseek-chat",
            Self::TogetherAI => "meta-llama/Llama-3-70b-chat-hf",
            Self::Venice => "llama-3.1-405b",
        }
    }

    /// Whether the vendor speaks the OpenAI chat-completions dialect.
    pub fn is_openai_compatible(&self) -> bool {
        !matches!(self, Self::Anthropic)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized || (normalized == "together" && *p == Self::TogetherAI))
            .ok_or_else(|| crate::error::Error::Config(format!("Unknown provider: {}", s)))
    }
}

/// Coarse request category used to rank provider priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Coding,
    Research,
    Analysis,
    Creative,
    Chat,
    Reasoning,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::Coding,
        TaskType::Research,
        TaskType::Analysis,
        TaskType::Creative,
        TaskType::Chat,
        TaskType::Reasoning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Creative => "creative",
            Self::Chat => "chat",
            Self::Reasoning => "reasoning",
        }
    }

    /// Classify a prompt based on content analysis.
    pub fn classify(text: &str) -> Self {
        static PATTERNS: OnceLock<TaskPatterns> = OnceLock::new();
        let patterns = PATTERNS.get_or_init(TaskPatterns::new);

        let text_lower = text.to_lowercase();

        // Check patterns in order of specificity
        if patterns.coding.is_match(&text_lower) {
            TaskType::Coding
        } else if patterns.reasoning.is_match(&text_lower) {
            TaskType::Reasoning
        } else if patterns.research.is_match(&text_lower) {
            TaskType::Research
        } else if patterns.analysis.is_match(&text_lower) {
            TaskType::Analysis
        } else if patterns.creative.is_match(&text_lower) {
            TaskType::Creative
        } else {
            TaskType::Chat
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled regex patterns for task classification.
struct TaskPatterns {
    coding: Regex,
    reasoning: Regex,
    research: Regex,
    analysis: Regex,
    creative: Regex,
}

impl TaskPatterns {
    fn new() -> Self {
        Self {
            coding: compile(
                r"(?x)
                \bcode\b|function|compile|debug|refactor|
                stack\s*trace|\bbug\b|unit\s+test|
                python|\brust\b|javascript|typescript|\bsql\b|
                implement|script|api\s+endpoint|regex
                ",
            ),
            reasoning: compile(
                r"(?x)
                step\s+by\s+step|prove|proof|logic|
                reason|deduce|infer|solve|puzzle|
                math|calculate|derive
                ",
            ),
            research: compile(
                r"(?x)
                research|latest|news|sources?|cite|
                find\s+out|look\s+up|search|
                who\s+is|when\s+did|current
                ",
            ),
            analysis: compile(
                r"(?x)
                analy[sz]e|analysis|compare|evaluate|
                metrics|revenue|forecast|pipeline|
                trend|breakdown|assess|summari[sz]e|kpi
                ",
            ),
            creative: compile(
                r"(?x)
                write\s+a|story|poem|creative|
                brainstorm|slogan|tagline|draft|
                imagine|email\s+copy|blog
                ",
            ),
        }
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("task patterns are static literals")
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-request generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Explicit provider override; always wins over scoring
    pub provider: Option<Provider>,
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Stream the response
    pub stream: bool,
    /// API key override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 30,
            stream: false,
            api_key: None,
            base_url: None,
        }
    }
}

/// One generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Conversation messages, in order
    pub messages: Vec<ChatMessage>,
    /// Task category driving provider priority
    pub task_type: TaskType,
    /// Generation settings
    pub config: RequestConfig,
    /// Free-form side-channel metadata, not interpreted by the router
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl LlmRequest {
    pub fn new(messages: Vec<ChatMessage>, task_type: TaskType) -> Self {
        Self {
            messages,
            task_type,
            config: RequestConfig::default(),
            context: None,
        }
    }

    /// Build a request whose task type is classified from the latest user message.
    pub fn auto(messages: Vec<ChatMessage>) -> Self {
        let task_type = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| TaskType::classify(&m.content))
            .unwrap_or(TaskType::Chat);
        Self::new(messages, task_type)
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.config.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn with_config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Approximate prompt size in tokens (serialized length / 4).
    pub fn approx_prompt_tokens(&self) -> u64 {
        let serialized = serde_json::to_string(&self.messages).unwrap_or_default();
        (serialized.len() / 4) as u64
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Value produced by a provider call; a partial chunk when streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text
    pub content: String,
    /// Provider that actually served the request
    pub provider: Provider,
    /// Model that actually served the request
    pub model: String,
    /// Token usage (absent on content-only stream chunks)
    pub usage: Option<TokenUsage>,
    /// Vendor-specific stop reason
    pub finish_reason: Option<String>,
    /// Measured latency
    pub latency_ms: f64,
    /// Estimated cost in USD
    pub cost_estimate: f64,
    /// Response timestamp
    pub created_at: DateTime<Utc>,
}

impl LlmResponse {
    pub fn new(provider: Provider, model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            provider,
            model: model.into(),
            usage: None,
            finish_reason: None,
            latency_ms: 0.0,
            cost_estimate: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Whether this is the terminal chunk of a stream (carries usage).
    pub fn is_final_chunk(&self) -> bool {
        self.usage.is_some()
    }
}
