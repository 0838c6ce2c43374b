//! Startup configuration, populated from environment variables.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{PricingCatalog, Provider, RetryPolicy, RoutingConfig};
use crate::secrets::SecretStore;

/// Default cache TTL in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Static settings for one vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    /// Vendor
    pub provider: Provider,
    /// API key, if configured
    pub api_key: Option<String>,
    /// Default model
    pub model: String,
    /// API base URL
    pub base_url: String,
    /// Default temperature
    pub temperature: f64,
    /// Default max tokens
    pub max_tokens: u32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ProviderSettings {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            api_key: None,
            model: provider.default_model().to_string(),
            base_url: provider.default_base_url().to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 30,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Process-wide configuration for the LLM subsystem.
#[derive(Debug, Clone)]
pub struct SophiaConfig {
    /// Per-vendor settings
    pub providers: HashMap<Provider, ProviderSettings>,
    /// Redis URL for the response cache; in-memory cache when absent
    pub redis_url: Option<String>,
    /// Response cache TTL in seconds
    pub cache_ttl_secs: u64,
    /// Pricing tables
    pub pricing: PricingCatalog,
    /// Routing priorities and fallback chain
    pub routing: RoutingConfig,
    /// Client-level retry policy
    pub retry: RetryPolicy,
}

impl Default for SophiaConfig {
    fn default() -> Self {
        Self {
            providers: Provider::ALL
                .into_iter()
                .map(|p| (p, ProviderSettings::new(p)))
                .collect(),
            redis_url: None,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            pricing: PricingCatalog::builtin(),
            routing: RoutingConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SophiaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// Per provider: `<PREFIX>_API_KEY`, `LLM_<PREFIX>_MODEL`,
    /// `LLM_<PREFIX>_BASE_URL`. Global: `LLM_TEMPERATURE`, `LLM_MAX_TOKENS`,
    /// `LLM_TIMEOUT_SECS`, `REDIS_URL`, `LLM_CACHE_TTL_SECS`, `LLM_PRICING_JSON`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let temperature = parse_var::<f64>(&non_empty, "LLM_TEMPERATURE")?;
        let max_tokens = parse_var::<u32>(&non_empty, "LLM_MAX_TOKENS")?;
        let timeout_secs = parse_var::<u64>(&non_empty, "LLM_TIMEOUT_SECS")?;

        let mut providers = HashMap::new();
        for provider in Provider::ALL {
            let prefix = provider.env_prefix();
            let mut settings = ProviderSettings::new(provider);
            settings.api_key = non_empty(&format!("{}_API_KEY", prefix));
            if let Some(model) = non_empty(&format!("LLM_{}_MODEL", prefix)) {
                settings.model = model;
            }
            if let Some(url) = non_empty(&format!("LLM_{}_BASE_URL", prefix)) {
                settings.base_url = url;
            }
            if let Some(t) = temperature {
                settings.temperature = t;
            }
            if let Some(m) = max_tokens {
                settings.max_tokens = m;
            }
            if let Some(secs) = timeout_secs {
                settings.timeout_secs = secs;
            }
            providers.insert(provider, settings);
        }

        let pricing = match non_empty("LLM_PRICING_JSON") {
            Some(json) => PricingCatalog::from_json(&json)?,
            None => PricingCatalog::builtin(),
        };

        Ok(Self {
            providers,
            redis_url: non_empty("REDIS_URL"),
            cache_ttl_secs: parse_var::<u64>(&non_empty, "LLM_CACHE_TTL_SECS")?
                .unwrap_or(DEFAULT_CACHE_TTL_SECS),
            pricing,
            routing: RoutingConfig::default(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_provider(mut self, settings: ProviderSettings) -> Self {
        self.providers.insert(settings.provider, settings);
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fill missing API keys from a secret store (`<PREFIX>_API_KEY`).
    pub async fn resolve_api_keys(&mut self, secrets: &dyn SecretStore) {
        for settings in self.providers.values_mut() {
            if settings.api_key.is_some() {
                continue;
            }
            let name = format!("{}_API_KEY", settings.provider.env_prefix());
            if let Some(key) = secrets.get_secret(&name).await {
                debug!(provider = %settings.provider, "API key resolved from secret store");
                settings.api_key = Some(key);
            }
        }
    }

    /// Providers with an API key.
    pub fn configured_providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self
            .providers
            .values()
            .filter(|s| s.api_key.is_some())
            .map(|s| s.provider)
            .collect();
        providers.sort();
        providers
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Invalid {}='{}': {}", name, raw, e)))
        })
        .transpose()
}
