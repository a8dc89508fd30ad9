use async_trait::async_trait;
use switchboard_types::{GatewayError, PlatformKey, Result};

use crate::{ChunkFn, CompletionOptions, CompletionResult, EmbeddingResult, Message, SpeechOptions};

// ---------------------------------------------------------------------------
// PlatformAdapter
// ---------------------------------------------------------------------------

/// One provider behind the uniform completion / embedding contract.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn key(&self) -> PlatformKey;

    /// Human-readable name for pickers and logs.
    fn label(&self) -> &str;

    /// Supported models in display order; the first is the default.
    fn models(&self) -> &[&'static str];

    fn default_model(&self) -> &str {
        self.models().first().copied().unwrap_or_default()
    }

    /// Default system prompt prepended by callers; empty when the provider has none.
    fn system_prompt(&self) -> &str {
        ""
    }

    fn count_tokens(&self, text: &str) -> usize;

    /// Stream a completion for `messages`, passing each delta to `on_chunk`.
    ///
    /// Only an unusable history is an error. Transport and decode failures
    /// end the stream and return whatever was accumulated.
    async fn completion(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        on_chunk: Option<&mut ChunkFn<'_>>,
    ) -> Result<CompletionResult>;

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    async fn speech(&self, _text: &str, _options: &SpeechOptions) -> Result<Vec<u8>> {
        Err(GatewayError::UnsupportedOperation {
            provider: self.key().to_string(),
            operation: "speech".into(),
        })
    }

    fn supports_speech(&self) -> bool {
        false
    }
}

/// Pick `requested` if it is in `models`, otherwise the first entry.
pub fn resolve_model<'a>(models: &[&'a str], requested: &str, case_insensitive: bool) -> &'a str {
    let found = models.iter().copied().find(|m| {
        if case_insensitive {
            m.eq_ignore_ascii_case(requested)
        } else {
            *m == requested
        }
    });
    match found {
        Some(m) => m,
        None => {
            let fallback = models.first().copied().unwrap_or_default();
            if !requested.is_empty() {
                tracing::debug!(requested, fallback, "model not in catalogue, using default");
            }
            fallback
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Copy caller-supplied extra options into a request object. Keys already set win.
pub(crate) fn merge_extra(
    target: &mut serde_json::Value,
    extra: &std::collections::HashMap<String, serde_json::Value>,
) {
    if let Some(obj) = target.as_object_mut() {
        for (k, v) in extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// Map a non-success HTTP response to an [`GatewayError::UpstreamError`],
/// preferring the provider's own error message over the raw body.
pub(crate) fn http_error(provider: &str, status: u16, body: &str) -> GatewayError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            [
                v["error"]["message"].as_str(),
                v["message"].as_str(),
                v["error_msg"].as_str(),
            ]
            .into_iter()
            .flatten()
            .next()
            .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect());
    GatewayError::UpstreamError {
        provider: provider.to_string(),
        status,
        message,
        retryable: status == 429 || status >= 500,
    }
}

// ---------------------------------------------------------------------------
// DynPlatform
// ---------------------------------------------------------------------------

pub struct DynPlatform(Box<dyn PlatformAdapter>);

impl DynPlatform {
    pub fn new(platform: impl PlatformAdapter + 'static) -> Self {
        Self(Box::new(platform))
    }

    pub fn key(&self) -> PlatformKey {
        self.0.key()
    }

    pub fn label(&self) -> &str {
        self.0.label()
    }

    pub fn models(&self) -> &[&'static str] {
        self.0.models()
    }

    pub fn default_model(&self) -> &str {
        self.0.default_model()
    }

    pub fn system_prompt(&self) -> &str {
        self.0.system_prompt()
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.0.count_tokens(text)
    }

    pub async fn completion(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        on_chunk: Option<&mut ChunkFn<'_>>,
    ) -> Result<CompletionResult> {
        self.0.completion(messages, options, on_chunk).await
    }

    pub async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.0.embed_texts(texts).await
    }

    pub async fn speech(&self, text: &str, options: &SpeechOptions) -> Result<Vec<u8>> {
        self.0.speech(text, options).await
    }

    pub fn supports_speech(&self) -> bool {
        self.0.supports_speech()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockPlatform;

    #[async_trait]
    impl PlatformAdapter for MockPlatform {
        fn key(&self) -> PlatformKey {
            PlatformKey::Qwen
        }

        fn label(&self) -> &str {
            "mock"
        }

        fn models(&self) -> &[&'static str] {
            &["mock-large", "mock-small"]
        }

        fn count_tokens(&self, text: &str) -> usize {
            text.len()
        }

        async fn completion(
            &self,
            messages: &[Message],
            _options: &CompletionOptions,
            mut on_chunk: Option<&mut ChunkFn<'_>>,
        ) -> Result<CompletionResult> {
            let reply = format!("echo {}", messages.len());
            if let Some(cb) = on_chunk.as_deref_mut() {
                cb(&reply);
            }
            Ok(CompletionResult {
                content: reply,
                total_tokens: 3,
            })
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
            Ok(EmbeddingResult {
                embeddings: texts.iter().map(|_| vec![0.0]).collect(),
                total_tokens: texts.len() as u64,
            })
        }
    }

    #[test]
    fn default_model_is_first_catalogue_entry() {
        let platform = DynPlatform::new(MockPlatform);
        assert_eq!(platform.default_model(), "mock-large");
        assert_eq!(platform.system_prompt(), "");
        assert!(!platform.supports_speech());
    }

    #[test]
    fn resolve_model_falls_back_to_default() {
        let models = ["gpt-4", "gpt-3.5-turbo"];
        assert_eq!(resolve_model(&models, "gpt-3.5-turbo", false), "gpt-3.5-turbo");
        assert_eq!(resolve_model(&models, "GPT-3.5-Turbo", true), "gpt-3.5-turbo");
        assert_eq!(resolve_model(&models, "GPT-3.5-Turbo", false), "gpt-4");
        assert_eq!(resolve_model(&models, "", false), "gpt-4");
    }

    #[test]
    fn http_error_prefers_provider_message() {
        let err = http_error("openai", 429, r#"{"error":{"message":"Rate limit reached"}}"#);
        match err {
            GatewayError::UpstreamError { status, message, retryable, .. } => {
                assert_eq!(status, 429);
                assert_eq!(message, "Rate limit reached");
                assert!(retryable);
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = http_error("wenxin", 400, "not json");
        assert!(!err.is_retryable());
        assert!(err.to_string().ends_with("not json"));
    }

    #[test]
    fn merge_extra_does_not_override() {
        let mut body = serde_json::json!({"model": "gpt-4", "stream": true});
        let extra = HashMap::from([
            ("model".to_string(), serde_json::json!("other")),
            ("top_p".to_string(), serde_json::json!(0.5)),
        ]);
        merge_extra(&mut body, &extra);
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["top_p"], 0.5);
    }

    #[tokio::test]
    async fn speech_is_unsupported_by_default() {
        let platform = DynPlatform::new(MockPlatform);
        let err = platform
            .speech("hello", &SpeechOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn dyn_platform_in_hashmap() {
        let mut platforms: HashMap<PlatformKey, DynPlatform> = HashMap::new();
        platforms.insert(PlatformKey::Qwen, DynPlatform::new(MockPlatform));

        let platform = &platforms[&PlatformKey::Qwen];
        let mut seen = Vec::new();
        let mut cb = |d: &str| {
            seen.push(d.to_string());
            true
        };
        let result = platform
            .completion(&[Message::user("hi")], &CompletionOptions::default(), Some(&mut cb))
            .await
            .unwrap();
        assert_eq!(result.content, "echo 1");
        assert_eq!(seen, vec!["echo 1"]);
    }
}
