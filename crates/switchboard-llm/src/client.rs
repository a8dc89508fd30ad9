use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use switchboard_types::{GatewayError, PlatformKey, Result, SystemConfig};

use crate::{
    ChunkFn, CompletionOptions, CompletionResult, DynPlatform, EmbeddingResult, Message,
    OpenAiAdapter, PlatformAdapter, QwenAdapter, SpeechOptions, WenxinAdapter,
};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

pub trait Middleware: Send + Sync {
    fn before(&self, _platform: PlatformKey, _messages: &[Message], _options: &mut CompletionOptions) {}
    fn after(&self, _platform: PlatformKey, _options: &CompletionOptions, _result: &mut CompletionResult) {}
    fn after_embedding(&self, _platform: PlatformKey, _result: &EmbeddingResult) {}
}

// ---------------------------------------------------------------------------
// Built-in middleware: LoggingMiddleware
// ---------------------------------------------------------------------------

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, platform: PlatformKey, messages: &[Message], options: &mut CompletionOptions) {
        tracing::info!(
            %platform,
            model = %options.model,
            messages = messages.len(),
            "completion request"
        );
    }

    fn after(&self, platform: PlatformKey, _options: &CompletionOptions, result: &mut CompletionResult) {
        tracing::info!(
            %platform,
            chars = result.content.chars().count(),
            total_tokens = result.total_tokens,
            "completion response"
        );
    }

    fn after_embedding(&self, platform: PlatformKey, result: &EmbeddingResult) {
        tracing::info!(
            %platform,
            vectors = result.embeddings.len(),
            total_tokens = result.total_tokens,
            "embedding response"
        );
    }
}

// ---------------------------------------------------------------------------
// Built-in middleware: UsageTrackingMiddleware
// ---------------------------------------------------------------------------

/// Running token totals across calls. Clones share the same counters, so keep
/// one clone to read the totals after handing another to the gateway.
#[derive(Clone, Default)]
pub struct UsageTrackingMiddleware {
    completion_tokens: Arc<AtomicU64>,
    embedding_tokens: Arc<AtomicU64>,
}

impl UsageTrackingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::Relaxed)
    }

    pub fn embedding_tokens(&self) -> u64 {
        self.embedding_tokens.load(Ordering::Relaxed)
    }
}

impl Middleware for UsageTrackingMiddleware {
    fn after(&self, _platform: PlatformKey, _options: &CompletionOptions, result: &mut CompletionResult) {
        self.completion_tokens
            .fetch_add(result.total_tokens, Ordering::Relaxed);
    }

    fn after_embedding(&self, _platform: PlatformKey, result: &EmbeddingResult) {
        self.embedding_tokens
            .fetch_add(result.total_tokens, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// ModelInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub platform: PlatformKey,
    pub is_default: bool,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Provider-key lookup table over the registered adapters.
pub struct Gateway {
    platforms: HashMap<PlatformKey, DynPlatform>,
    middleware: Vec<Box<dyn Middleware>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            platforms: HashMap::new(),
            middleware: Vec::new(),
        }
    }

    /// Register (or replace) the adapter for its key.
    pub fn register_platform(&mut self, platform: impl PlatformAdapter + 'static) {
        let key = platform.key();
        self.platforms.insert(key, DynPlatform::new(platform));
    }

    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    /// Build adapters for every platform whose credentials are present.
    pub fn from_config(config: &SystemConfig) -> Result<Self> {
        let mut gateway = Self::new();

        for key in PlatformKey::ALL {
            let platform_config = config.platform_config(key);
            if !platform_config.has_credentials(key) {
                tracing::debug!(platform = %key, "no credentials, skipping");
                continue;
            }
            let platform_config = platform_config.clone();
            match key {
                PlatformKey::OpenAi => gateway.register_platform(OpenAiAdapter::new(platform_config)?),
                PlatformKey::Qwen => gateway.register_platform(QwenAdapter::new(platform_config)?),
                PlatformKey::Wenxin => gateway.register_platform(WenxinAdapter::new(platform_config)?),
            }
        }

        if gateway.platforms.is_empty() {
            return Err(GatewayError::Configuration {
                provider: "gateway".into(),
                message: "no platform has credentials configured".into(),
            });
        }
        Ok(gateway)
    }

    /// Create from environment variables (detect available credentials).
    pub fn from_env() -> Result<Self> {
        Self::from_config(&SystemConfig::from_env())
    }

    pub fn platform(&self, key: PlatformKey) -> Result<&DynPlatform> {
        self.platforms
            .get(&key)
            .ok_or_else(|| GatewayError::UnknownPlatform(key.to_string()))
    }

    /// Registered platforms in canonical key order.
    pub fn platforms(&self) -> impl Iterator<Item = &DynPlatform> + '_ {
        PlatformKey::ALL
            .into_iter()
            .filter_map(|key| self.platforms.get(&key))
    }

    /// Every model of every registered platform; defaults first within a platform.
    pub fn models(&self) -> Vec<ModelInfo> {
        self.platforms()
            .flat_map(|p| {
                let key = p.key();
                p.models().iter().enumerate().map(move |(i, id)| ModelInfo {
                    id: *id,
                    platform: key,
                    is_default: i == 0,
                })
            })
            .collect()
    }

    pub fn platform_for_model(&self, model: &str) -> Option<PlatformKey> {
        let models = self.models();
        models
            .iter()
            .find(|m| m.id == model)
            .or_else(|| models.iter().find(|m| m.id.eq_ignore_ascii_case(model)))
            .map(|m| m.platform)
    }

    pub async fn completion(
        &self,
        key: PlatformKey,
        messages: &[Message],
        options: &CompletionOptions,
        on_chunk: Option<&mut ChunkFn<'_>>,
    ) -> Result<CompletionResult> {
        let platform = self.platform(key)?;
        let mut options = options.clone();

        for m in &self.middleware {
            m.before(key, messages, &mut options);
        }

        let mut result = platform.completion(messages, &options, on_chunk).await?;

        for m in &self.middleware {
            m.after(key, &options, &mut result);
        }

        Ok(result)
    }

    pub async fn embed_texts(&self, key: PlatformKey, texts: &[String]) -> Result<EmbeddingResult> {
        let result = self.platform(key)?.embed_texts(texts).await?;
        for m in &self.middleware {
            m.after_embedding(key, &result);
        }
        Ok(result)
    }

    pub fn count_tokens(&self, key: PlatformKey, text: &str) -> Result<usize> {
        Ok(self.platform(key)?.count_tokens(text))
    }

    pub async fn speech(&self, key: PlatformKey, text: &str, options: &SpeechOptions) -> Result<Vec<u8>> {
        self.platform(key)?.speech(text, options).await
    }

    /// The newest suffix of `messages` whose estimated cost fits `budget`.
    ///
    /// Costs come from the platform's own token counter. The final message is
    /// always kept, even when it alone exceeds the budget.
    pub fn fit_history(&self, key: PlatformKey, messages: &[Message], budget: usize) -> Result<Vec<Message>> {
        let platform = self.platform(key)?;
        let mut used = 0usize;
        let mut start = messages.len();

        for (i, msg) in messages.iter().enumerate().rev() {
            let cost = platform.count_tokens(msg.content_str());
            if start < messages.len() && used + cost > budget {
                break;
            }
            used += cost;
            start = i;
        }

        if start > 0 {
            tracing::debug!(platform = %key, dropped = start, used, budget, "history trimmed to budget");
        }
        Ok(messages[start..].to_vec())
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
