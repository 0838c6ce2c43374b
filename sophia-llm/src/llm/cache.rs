//! Response caching for LLM requests.
//!
//! Keys are `llm_cache:` plus the md5 of a canonical JSON encoding of
//! `{messages, model, task_type, temperature}`. The encoding matches
//! Python's `json.dumps(..., sort_keys=True)` byte for byte so caches
//! populated by other services stay readable.
//!
//! Cache failures never fail the caller: backend errors are logged and
//! reported as misses or rejected writes.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{LlmRequest, LlmResponse};
use crate::config::{SophiaConfig, DEFAULT_CACHE_TTL_SECS};
use crate::error::{Error, Result};

/// Namespace prefix for cache keys.
pub const CACHE_KEY_PREFIX: &str = "llm_cache:";

/// Key/value backing store with per-key expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Establish the connection. Called at most once per successful connect.
    async fn connect(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, expiring after `ttl_secs`.
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<()>;

    /// Remove every key in the store, not only cache entries.
    async fn flush_all(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// In-process store; expiry is checked at read time.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use fred::interfaces::{ClientLike, KeysInterface};
    use fred::prelude::*;
    use fred::types::Expiration;

    use super::*;

    fn cache_error(error: RedisError) -> Error {
        Error::Cache(error.to_string())
    }

    /// Redis-backed store.
    #[derive(Clone)]
    pub struct RedisStore {
        client: RedisClient,
        url: String,
    }

    impl std::fmt::Debug for RedisStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisStore").field("url", &self.url).finish()
        }
    }

    impl RedisStore {
        /// Build a client for `url`; no connection is made until [`CacheStore::connect`].
        pub fn new(url: &str) -> Result<Self> {
            let config = RedisConfig::from_url(url).map_err(cache_error)?;
            Ok(Self {
                client: RedisClient::new(config, None, None, None),
                url: url.to_string(),
            })
        }
    }

    #[async_trait]
    impl CacheStore for RedisStore {
        async fn connect(&self) -> Result<()> {
            self.client.init().await.map_err(cache_error)?;
            debug!(url = %self.url, "connected to redis");
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.client
                .get::<Option<String>, _>(key)
                .await
                .map_err(cache_error)
        }

        async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
            self.client
                .set::<(), _, _>(key, value, Some(Expiration::EX(ttl_secs as i64)), None, false)
                .await
                .map_err(cache_error)
        }

        async fn flush_all(&self) -> Result<()> {
            self.client.flushall::<()>(false).await.map_err(cache_error)
        }

        fn is_connected(&self) -> bool {
            self.client.is_connected()
        }
    }
}

/// Stored cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub response: LlmResponse,
    pub created_at: DateTime<Utc>,
    /// Fixed at creation; reads do not extend it
    pub expires_at: DateTime<Utc>,
    /// Estimated cost avoided per hit, in USD
    pub cost_saved: f64,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub savings_usd: f64,
    pub total_requests: u64,
}

impl CacheStats {
    /// hits / total_requests, 0 before any request.
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests as f64
        }
    }
}

/// Counters plus derived values, as reported by [`ResponseCache::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheReport {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub savings_usd: f64,
    pub connected: bool,
}

/// Response cache over a [`CacheStore`].
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    default_ttl_secs: u64,
    stats: RwLock<CacheStats>,
    connected: OnceCell<()>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            stats: RwLock::new(CacheStats::default()),
            connected: OnceCell::new(),
        }
    }

    /// In-memory cache.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Redis when `REDIS_URL` is configured, memory otherwise.
    pub fn from_config(config: &SophiaConfig) -> Result<Self> {
        let store: Arc<dyn CacheStore> = match config.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(url) => Arc::new(RedisStore::new(url)?),
            #[cfg(not(feature = "redis"))]
            Some(_) => {
                return Err(Error::Config(
                    "REDIS_URL set but the redis feature is disabled".to_string(),
                ))
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(store).with_default_ttl(config.cache_ttl_secs))
    }

    pub fn with_default_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    /// Connect the backing store once. Failed attempts may be retried.
    pub async fn connect(&self) -> bool {
        let result = self
            .connected
            .get_or_try_init(|| async { self.store.connect().await })
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "cache store connection failed");
                false
            }
        }
    }

    /// Look up a cached response. Backend errors count as misses.
    pub async fn get(&self, request: &LlmRequest) -> Option<LlmResponse> {
        let key = cache_key(request);
        let entry = match self.fetch(&key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed");
                None
            }
        };

        let mut stats = self.stats.write().await;
        stats.total_requests += 1;
        match entry {
            Some(entry) => {
                stats.hits += 1;
                stats.savings_usd += entry.cost_saved;
                debug!(key = %key, cost_saved = entry.cost_saved, "cache hit");
                Some(entry.response)
            }
            None => {
                stats.misses += 1;
                debug!(key = %key, "cache miss");
                None
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<CachedResponse>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a response with the default TTL.
    pub async fn set(&self, request: &LlmRequest, response: &LlmResponse) -> bool {
        self.set_with_ttl(request, response, self.default_ttl_secs)
            .await
    }

    /// Store a response expiring after `ttl_secs`. Returns whether the store accepted it.
    pub async fn set_with_ttl(&self, request: &LlmRequest, response: &LlmResponse, ttl_secs: u64) -> bool {
        let key = cache_key(request);
        let created_at = Utc::now();
        let entry = CachedResponse {
            response: response.clone(),
            created_at,
            expires_at: created_at + chrono::Duration::seconds(ttl_secs as i64),
            cost_saved: response.cost_estimate,
        };

        let result = match serde_json::to_string(&entry) {
            Ok(raw) => self.store.set_ex(&key, raw, ttl_secs).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                debug!(key = %key, ttl_secs, "cached response");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache write failed");
                false
            }
        }
    }

    pub async fn get_stats(&self) -> CacheReport {
        let stats = self.stats.read().await;
        CacheReport {
            hits: stats.hits,
            misses: stats.misses,
            total_requests: stats.total_requests,
            hit_rate: stats.hit_rate(),
            savings_usd: stats.savings_usd,
            connected: self.store.is_connected(),
        }
    }

    /// Flush the whole backing store and reset counters.
    ///
    /// Not scoped to cache keys: anything else in the store is lost too.
    pub async fn clear(&self) -> bool {
        let flushed = match self.store.flush_all().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "cache flush failed");
                false
            }
        };
        *self.stats.write().await = CacheStats::default();
        flushed
    }
}

/// Cache key for a request.
pub fn cache_key(request: &LlmRequest) -> String {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();
    let payload = json!({
        "messages": messages,
        "task_type": request.task_type.as_str(),
        "model": request.config.model,
        "temperature": request.config.temperature,
    });

    let canonical = python_json(&payload);
    format!("{}{:x}", CACHE_KEY_PREFIX, md5::compute(canonical.as_bytes()))
}

/// Encode like Python's `json.dumps(value, sort_keys=True)`.
pub(crate) fn python_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_string(key, out);
                out.push_str(": ");
                write_value(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    match n.as_f64() {
        Some(f) if n.is_f64() => {
            if f.is_nan() {
                out.push_str("NaN");
            } else if f.is_infinite() {
                out.push_str(if f > 0.0 { "Infinity" } else { "-Infinity" });
            } else if f.fract() == 0.0 && f.abs() < 1e16 {
                // Python float repr keeps the trailing .0
                let _ = write!(out, "{:.1}", f);
            } else {
                let _ = write!(out, "{}", n);
            }
        }
        _ => {
            let _ = write!(out, "{}", n);
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04x}", unit);
                }
            }
        }
    }
    out.push('"');
}
