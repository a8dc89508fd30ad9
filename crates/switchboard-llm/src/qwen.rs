//! DashScope (Qwen) adapter.
//!
//! DashScope's SSE stream is short enough in practice that the body is read
//! whole and then replayed to the caller; the first `finish_reason`-less
//! event or error object ends the replay.

use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use switchboard_types::{GatewayError, PlatformConfig, PlatformKey, Result};

use crate::embedding::EmbeddingBatcher;
use crate::framer::{Accumulator, Flow, TokenUpdate};
use crate::normalize::MessageShape;
use crate::openai::vector;
use crate::provider::{http_error, merge_extra, resolve_model};
use crate::tokens::TokenCounter;
use crate::{ChunkFn, CompletionOptions, CompletionResult, EmbeddingResult, Message, PlatformAdapter};

const PROVIDER: &str = "qwen";
const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/api/v1/services";
const GENERATION_PATH: &str = "/aigc/text-generation/generation";
const EMBEDDING_PATH: &str = "/embeddings/text-embedding/text-embedding";
const EMBEDDING_MODEL: &str = "text-embedding-v1";
const EMBEDDING_BATCH_SIZE: usize = 25;
const DEFAULT_TEMPERATURE: f64 = 0.95;

pub const QWEN_MODELS: &[&str] = &["qwen-plus", "qwen-turbo", "qwen-14b-chat", "qwen-7b-chat"];

pub struct QwenAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    batcher: EmbeddingBatcher,
}

impl fmt::Debug for QwenAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QwenAdapter")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl QwenAdapter {
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GatewayError::Configuration {
                provider: PROVIDER.into(),
                message: "Qwen apiKey is required".into(),
            })?;
        let base_url = config
            .base_path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            batcher: EmbeddingBatcher::new(Some(EMBEDDING_BATCH_SIZE))
                .with_dimension(config.dimension),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(PlatformConfig::from_env(PlatformKey::Qwen))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request_body(messages: &[Message], options: &CompletionOptions, seed: u32) -> Value {
        let mut parameters = json!({
            "seed": seed,
            "temperature": options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "enable_search": options.enable_search.unwrap_or(true),
            "incremental_output": true,
        });
        merge_extra(&mut parameters, &options.extra);
        json!({
            "model": resolve_model(QWEN_MODELS, &options.model, false),
            "input": { "messages": messages },
            "parameters": parameters,
        })
    }

    async fn embed_batch(&self, batch: Vec<String>) -> Result<EmbeddingResult> {
        let body = json!({
            "model": EMBEDDING_MODEL,
            "input": { "texts": batch },
            "parameters": { "text_type": "document" },
        });
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, EMBEDDING_PATH))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e))?;
        if status != reqwest::StatusCode::OK {
            return Err(http_error(PROVIDER, status.as_u16(), &text));
        }
        Ok(parse_embeddings(&serde_json::from_str(&text)?))
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// One non-empty delta recovered from a buffered DashScope stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamChunk {
    pub content: String,
    /// Running `input_tokens + output_tokens` as reported with this delta.
    pub tokens: u64,
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Extract deltas from a complete DashScope SSE body.
///
/// Stops at an error object (`code` + `message`), at an event without
/// `output`, or right after an event whose `finish_reason` is absent.
/// Lines that are not `data:` events or do not parse are skipped.
pub(crate) fn parse_stream_body(body: &str) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    for line in body.split('\n') {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let Ok(msg) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if is_truthy(&msg["code"]) && is_truthy(&msg["message"]) {
            tracing::warn!(
                provider = PROVIDER,
                code = %msg["code"],
                message = msg["message"].as_str().unwrap_or_default(),
                "stream ended with an error event"
            );
            break;
        }
        let output = &msg["output"];
        if !is_truthy(output) {
            break;
        }
        let usage = &msg["usage"];
        chunks.push(StreamChunk {
            content: output["text"].as_str().unwrap_or_default().to_string(),
            tokens: usage["output_tokens"].as_u64().unwrap_or(0)
                + usage["input_tokens"].as_u64().unwrap_or(0),
        });
        if !is_truthy(&output["finish_reason"]) {
            break;
        }
    }
    chunks.retain(|c| !c.content.is_empty());
    chunks
}

fn parse_embeddings(body: &Value) -> EmbeddingResult {
    let mut items: Vec<&Value> = body["output"]["embeddings"]
        .as_array()
        .map(|xs| xs.iter().collect())
        .unwrap_or_default();
    if items.iter().all(|item| item["text_index"].is_u64()) {
        items.sort_by_key(|item| item["text_index"].as_u64());
    }
    EmbeddingResult {
        embeddings: items.into_iter().map(|item| vector(&item["embedding"])).collect(),
        total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0),
    }
}

// ---------------------------------------------------------------------------
// PlatformAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl PlatformAdapter for QwenAdapter {
    fn key(&self) -> PlatformKey {
        PlatformKey::Qwen
    }

    fn label(&self) -> &str {
        "通义千问(灵积)"
    }

    fn models(&self) -> &[&'static str] {
        QWEN_MODELS
    }

    fn count_tokens(&self, text: &str) -> usize {
        TokenCounter::for_platform(PlatformKey::Qwen).count(text)
    }

    async fn completion(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        on_chunk: Option<&mut ChunkFn<'_>>,
    ) -> Result<CompletionResult> {
        let normalized = MessageShape::LeadingUser.normalize(messages)?;
        let seed: u32 = rand::thread_rng().gen_range(1..=65535);
        let body = Self::build_request_body(&normalized.messages, options, seed);
        let mut acc = Accumulator::new(on_chunk);

        tracing::debug!(provider = PROVIDER, model = %body["model"], messages = normalized.messages.len(), "sending completion");
        let sent = self
            .client
            .post(format!("{}{}", self.base_url, GENERATION_PATH))
            .bearer_auth(&self.api_key)
            .header("X-DashScope-SSE", "enable")
            .json(&body)
            .send()
            .await;
        let text = match sent {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::debug!(provider = PROVIDER, status = resp.status().as_u16(), "non-success status, reading body for error events");
                }
                resp.text().await
            }
            Err(e) => Err(e),
        };
        let text = match text {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(provider = PROVIDER, error = %e, "completion request failed");
                return Ok(acc.finish());
            }
        };

        for chunk in parse_stream_body(&text) {
            if acc.offer(&chunk.content, TokenUpdate::Observed(chunk.tokens)) == Flow::Stop {
                break;
            }
        }

        let cancelled = acc.is_cancelled();
        let result = acc.finish();
        tracing::debug!(provider = PROVIDER, tokens = result.total_tokens, cancelled, "completion finished");
        Ok(result)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.batcher
            .run(PROVIDER, texts, |batch| self.embed_batch(batch))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> QwenAdapter {
        QwenAdapter::new(PlatformConfig {
            api_key: Some("sk-dash".into()),
            ..PlatformConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let err = QwenAdapter::new(PlatformConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Qwen apiKey is required"));
        assert!(!format!("{:?}", adapter()).contains("sk-dash"));
    }

    #[test]
    fn request_body_shape() {
        let body = QwenAdapter::build_request_body(
            &[Message::user("你好")],
            &CompletionOptions::with_model("qwen-turbo"),
            42,
        );
        assert_eq!(body["model"], "qwen-turbo");
        assert_eq!(body["input"]["messages"][0]["content"], "你好");
        assert_eq!(body["parameters"]["seed"], 42);
        assert_eq!(body["parameters"]["temperature"], 0.95);
        assert_eq!(body["parameters"]["enable_search"], true);
        assert_eq!(body["parameters"]["incremental_output"], true);
    }

    #[test]
    fn unknown_model_and_explicit_search_flag() {
        let options = CompletionOptions {
            model: "QWEN-PLUS".into(),
            enable_search: Some(false),
            ..CompletionOptions::default()
        };
        let body = QwenAdapter::build_request_body(&[Message::user("hi")], &options, 1);
        assert_eq!(body["model"], "qwen-plus");
        assert_eq!(body["parameters"]["enable_search"], false);
    }

    #[test]
    fn stream_body_yields_incremental_text() {
        let body = concat!(
            "id:1\nevent:result\n:HTTP_STATUS/200\n",
            "data:{\"output\":{\"text\":\"你\",\"finish_reason\":\"null\"},\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}\n\n",
            "id:2\nevent:result\n",
            "data:{\"output\":{\"text\":\"好\",\"finish_reason\":\"null\"},\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}\n\n",
            "data:{\"output\":{\"text\":\"\",\"finish_reason\":\"stop\"},\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}\n",
        );
        let chunks = parse_stream_body(body);
        assert_eq!(
            chunks,
            vec![
                StreamChunk { content: "你".into(), tokens: 6 },
                StreamChunk { content: "好".into(), tokens: 7 },
            ]
        );
    }

    #[test]
    fn error_event_ends_stream_silently() {
        let body = concat!(
            "data:{\"output\":{\"text\":\"partial\",\"finish_reason\":\"null\"},\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}\n",
            "data:{\"code\":\"DataInspectionFailed\",\"message\":\"Input data may contain inappropriate content.\"}\n",
            "data:{\"output\":{\"text\":\"late\",\"finish_reason\":\"null\"}}\n",
        );
        let chunks = parse_stream_body(body);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "partial");
    }

    #[test]
    fn missing_finish_reason_ends_after_the_event() {
        let body = concat!(
            "data:{\"output\":{\"text\":\"one\"}}\n",
            "data:{\"output\":{\"text\":\"two\",\"finish_reason\":\"null\"}}\n",
        );
        let chunks = parse_stream_body(body);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "one");
        assert_eq!(chunks[0].tokens, 0);
    }

    #[test]
    fn missing_output_ends_stream() {
        assert!(parse_stream_body("data:{\"request_id\":\"x\"}\ndata:{\"output\":{\"text\":\"a\",\"finish_reason\":\"null\"}}\n").is_empty());
        assert!(parse_stream_body("").is_empty());
    }

    #[test]
    fn embeddings_follow_text_index() {
        let body = json!({
            "output": {"embeddings": [
                {"text_index": 1, "embedding": [2.0]},
                {"text_index": 0, "embedding": [1.0]}
            ]},
            "usage": {"total_tokens": 4}
        });
        let result = parse_embeddings(&body);
        assert_eq!(result.embeddings, vec![vec![1.0], vec![2.0]]);
        assert_eq!(result.total_tokens, 4);
    }

    #[test]
    fn metadata() {
        let adapter = adapter();
        assert_eq!(adapter.label(), "通义千问(灵积)");
        assert_eq!(adapter.default_model(), "qwen-plus");
        assert_eq!(adapter.count_tokens(""), 0);
        assert!(!adapter.supports_speech());
    }
}
