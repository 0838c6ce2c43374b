//! Per-model pricing tables used for cost estimation.
//!
//! Resolution order for a model name: exact match, then the longest
//! prefix among the table's prefix candidates, then the table default.
//! Tables are plain data and can be replaced from JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::types::{Provider, TokenUsage};
use crate::error::{Error, Result};

/// Price of a model in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Input cost per million tokens (USD)
    pub input: f64,
    /// Output cost per million tokens (USD)
    pub output: f64,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Calculate cost for given token counts.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output;
        input_cost + output_cost
    }
}

/// Pricing table for one vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    /// Model name to price
    pub models: BTreeMap<String, ModelPricing>,
    /// Models eligible for prefix matching of unknown snapshot names
    #[serde(default)]
    pub prefix_models: Vec<String>,
    /// Model whose price is used when nothing else matches
    pub default_model: String,
}

impl PricingTable {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            models: BTreeMap::new(),
            prefix_models: Vec::new(),
            default_model: default_model.into(),
        }
    }

    /// Add a model row.
    pub fn with_model(mut self, model: impl Into<String>, input: f64, output: f64) -> Self {
        self.models.insert(model.into(), ModelPricing::new(input, output));
        self
    }

    /// Add a model row that also participates in prefix matching.
    pub fn with_prefix_model(mut self, model: impl Into<String>, input: f64, output: f64) -> Self {
        let model = model.into();
        self.prefix_models.push(model.clone());
        self.with_model(model, input, output)
    }

    /// Parse a table from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(json)?;
        if !table.models.contains_key(&table.default_model) {
            return Err(Error::Config(format!(
                "Pricing default model '{}' has no pricing row",
                table.default_model
            )));
        }
        Ok(table)
    }

    /// Resolve the model row used for pricing `model`. Never fails.
    pub fn resolve(&self, model: &str) -> (&str, ModelPricing) {
        if let Some((name, pricing)) = self.models.get_key_value(model) {
            return (name.as_str(), *pricing);
        }

        let prefix_match = self
            .prefix_models
            .iter()
            .filter(|candidate| model.starts_with(candidate.as_str()))
            .max_by_key(|candidate| candidate.len())
            .and_then(|candidate| self.models.get_key_value(candidate));
        if let Some((name, pricing)) = prefix_match {
            return (name.as_str(), *pricing);
        }

        match self.models.get_key_value(&self.default_model) {
            Some((name, pricing)) => (name.as_str(), *pricing),
            // A table deserialized without its default row still prices at zero
            None => (self.default_model.as_str(), ModelPricing::new(0.0, 0.0)),
        }
    }

    /// Whether `model` matches a row exactly or by prefix.
    pub fn recognizes(&self, model: &str) -> bool {
        self.models.contains_key(model)
            || self
                .prefix_models
                .iter()
                .any(|candidate| model.starts_with(candidate.as_str()))
    }

    /// Pricing row for `model`.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.resolve(model).1
    }

    /// Estimated cost in USD.
    pub fn estimate_cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.pricing_for(model)
            .calculate_cost(usage.prompt_tokens, usage.completion_tokens)
    }

    /// Built-in table for a provider.
    pub fn builtin(provider: Provider) -> Self {
        match provider {
            Provider::OpenAI => Self::new("gpt-4o")
                .with_prefix_model("gpt-4o-mini", 0.15, 0.60)
                .with_prefix_model("gpt-4o", 2.50, 10.00)
                .with_prefix_model("gpt-4-turbo", 10.00, 30.00)
                .with_prefix_model("gpt-4", 30.00, 60.00)
                .with_prefix_model("gpt-3.5-turbo", 0.50, 1.50)
                .with_model("o1-preview", 15.00, 60.00)
                .with_model("o1-mini", 3.00, 12.00),
            Provider::Anthropic => Self::new("claude-3-5-sonnet-20241022")
                .with_model("claude-3-5-sonnet-20241022", 3.00, 15.00)
                .with_model("claude-3-5-haiku-20241022", 0.80, 4.00)
                .with_model("claude-3-opus-20240229", 15.00, 75.00)
                .with_model("claude-3-haiku-20240307", 0.25, 1.25)
                .with_prefix_model("claude-3-5-sonnet", 3.00, 15.00)
                .with_prefix_model("claude-3-5-haiku", 0.80, 4.00)
                .with_prefix_model("claude-3-opus", 15.00, 75.00)
                .with_prefix_model("claude-3-haiku", 0.25, 1.25),
            Provider::OpenRouter => Self::new("openai/gpt-4o")
                .with_prefix_model("openai/gpt-4o", 2.50, 10.00)
                .with_prefix_model("anthropic/claude-3.5-sonnet", 3.00, 15.00)
                .with_prefix_model("meta-llama/llama-3.1-70b-instruct", 0.52, 0.75)
                .with_prefix_model("google/gemini-pro-1.5", 1.25, 5.00),
            Provider::Perplexity => Self::new("llama-3.1-sonar-large-128k-online")
                .with_model("llama-3.1-sonar-small-128k-online", 0.20, 0.20)
                .with_model("llama-3.1-sonar-large-128k-online", 1.00, 1.00)
                .with_model("llama-3.1-sonar-huge-128k-online", 5.00, 5.00),
            Provider::Xai => Self::new("grok-beta")
                .with_prefix_model("grok-beta", 5.00, 15.00)
                .with_prefix_model("grok-2", 2.00, 10.00),
            Provider::Groq => Self::new("llama-3.1-70b-versatile")
                .with_model("llama-3.1-70b-versatile", 0.59, 0.79)
                .with_model("llama-3.1-8b-instant", 0.05, 0.08)
                .with_model("mixtral-8x7b-32768", 0.24, 0.24),
            Provider::Mistral => Self::new("mistral-large-latest")
                .with_prefix_model("mistral-large", 2.00, 6.00)
                .with_prefix_model("mistral-small", 0.20, 0.60)
                .with_prefix_model("codestral", 0.20, 0.60)
                .with_model("mistral-large-latest", 2.00, 6.00),
            Provider::DeepSeek => Self::new("deepseek-chat")
                .with_model("deepseek-chat", 0.14, 0.28)
                .with_model("deepseek-coder", 0.14, 0.28)
                .with_model("deepseek-reasoner", 0.55, 2.19),
            Provider::TogetherAI => Self::new("meta-llama/Llama-3-70b-chat-hf")
                .with_model("meta-llama/Llama-3-70b-chat-hf", 0.90, 0.90)
                .with_model("mistralai/Mixtral-8x7B-Instruct-v0.1", 0.60, 0.60)
                .with_model("Qwen/Qwen2.5-72B-Instruct-Turbo", 1.20, 1.20),
            Provider::Venice => Self::new("llama-3.1-405b")
                .with_model("llama-3.1-405b", 1.50, 6.00)
                .with_model("llama-3.3-70b", 0.70, 2.80),
        }
    }
}

/// Pricing tables for every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingCatalog {
    tables: HashMap<Provider, PricingTable>,
}

impl PricingCatalog {
    /// Catalog with the built-in table for every provider.
    pub fn builtin() -> Self {
        Self {
            tables: Provider::ALL
                .into_iter()
                .map(|p| (p, PricingTable::builtin(p)))
                .collect(),
        }
    }

    /// Parse a catalog of overrides from JSON; providers absent from the
    /// JSON keep their built-in table.
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: HashMap<Provider, PricingTable> = serde_json::from_str(json)?;
        let mut catalog = Self::builtin();
        for (provider, table) in overrides {
            if !table.models.contains_key(&table.default_model) {
                return Err(Error::Config(format!(
                    "Pricing default model '{}' for {} has no pricing row",
                    table.default_model, provider
                )));
            }
            catalog.tables.insert(provider, table);
        }
        Ok(catalog)
    }

    /// Table for a provider.
    pub fn table(&self, provider: Provider) -> PricingTable {
        self.tables
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| PricingTable::builtin(provider))
    }
}

impl Default for PricingCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
