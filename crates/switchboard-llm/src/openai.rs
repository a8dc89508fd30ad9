use std::fmt;

use async_trait::async_trait;
use serde_json::json;
use switchboard_types::{GatewayError, PlatformConfig, PlatformKey, Result};

use crate::embedding::EmbeddingBatcher;
use crate::framer::{drain_events, Accumulator, TokenUpdate};
use crate::normalize::MessageShape;
use crate::provider::{http_error, merge_extra};
use crate::tokens::TokenCounter;
use crate::{
    ChunkFn, CompletionOptions, CompletionResult, EmbeddingResult, Message, PlatformAdapter,
    SpeechOptions,
};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const EMBEDDING_MODEL: &str = "text-embedding-ada-002";
const DEFAULT_TEMPERATURE: f64 = 0.95;
const DEFAULT_FREQUENCY_PENALTY: f64 = 0.0;
const DEFAULT_TTS_MODEL: &str = "tts-1";
const DEFAULT_TTS_VOICE: &str = "alloy";
const DEFAULT_TTS_SPEED: f32 = 1.0;

pub const OPENAI_MODELS: &[&str] = &[
    "gpt-4-1106-preview",
    "gpt-4-vision-preview",
    "gpt-4",
    "gpt-4-32k",
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-1106",
    "gpt-3.5-turbo-16k",
];

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

pub struct OpenAiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    speech_defaults: SpeechOptions,
    batcher: EmbeddingBatcher,
}

impl fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("speech_defaults", &self.speech_defaults)
            .finish()
    }
}

impl OpenAiAdapter {
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GatewayError::Configuration {
                provider: PROVIDER.into(),
                message: "OpenAI API key is required".into(),
            })?;
        let base_url = config
            .base_path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            speech_defaults: SpeechOptions {
                model: config.tts_model,
                voice: config.tts_voice,
                speed: config.tts_speed,
            },
            batcher: EmbeddingBatcher::new(None).with_dimension(config.dimension),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(PlatformConfig::from_env(PlatformKey::OpenAi))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request_body(&self, messages: &[Message], options: &CompletionOptions) -> serde_json::Value {
        let mut body = json!({
            "stream": true,
            "model": request_model(&options.model),
            "temperature": options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "frequency_penalty": options.penalty_score.unwrap_or(DEFAULT_FREQUENCY_PENALTY),
            "messages": messages,
        });
        merge_extra(&mut body, &options.extra);
        body
    }

    async fn embed_batch(&self, batch: Vec<String>) -> Result<EmbeddingResult> {
        let inputs: Vec<String> = batch.iter().map(|t| t.replace('\n', "")).collect();
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": inputs, "model": EMBEDDING_MODEL }))
            .send()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e))?;
        if !status.is_success() {
            return Err(http_error(PROVIDER, status.as_u16(), &text));
        }
        let value: serde_json::Value = serde_json::from_str(&text)?;
        Ok(parse_embeddings(&value))
    }
}

/// Catalogue membership is case-insensitive; a matching model is sent as given.
fn request_model(requested: &str) -> &str {
    if OPENAI_MODELS.iter().any(|m| m.eq_ignore_ascii_case(requested)) {
        requested
    } else {
        OPENAI_MODELS[0]
    }
}

fn delta_content(event: &serde_json::Value) -> &str {
    event["choices"][0]["delta"]["content"].as_str().unwrap_or("")
}

fn parse_embeddings(body: &serde_json::Value) -> EmbeddingResult {
    let embeddings = body["data"]
        .as_array()
        .map(|items| items.iter().map(|item| vector(&item["embedding"])).collect())
        .unwrap_or_default();
    EmbeddingResult {
        embeddings,
        total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0),
    }
}

pub(crate) fn vector(value: &serde_json::Value) -> Vec<f32> {
    value
        .as_array()
        .map(|xs| xs.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// PlatformAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl PlatformAdapter for OpenAiAdapter {
    fn key(&self) -> PlatformKey {
        PlatformKey::OpenAi
    }

    fn label(&self) -> &str {
        "OpenAI"
    }

    fn models(&self) -> &[&'static str] {
        OPENAI_MODELS
    }

    fn count_tokens(&self, text: &str) -> usize {
        TokenCounter::for_platform(PlatformKey::OpenAi).count(text)
    }

    async fn completion(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        on_chunk: Option<&mut ChunkFn<'_>>,
    ) -> Result<CompletionResult> {
        let normalized = MessageShape::Passthrough.normalize(messages)?;
        let body = self.build_request_body(&normalized.messages, options);
        let mut acc = Accumulator::new(on_chunk);

        tracing::debug!(provider = PROVIDER, model = %body["model"], messages = normalized.messages.len(), "sending completion");
        let resp = match self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(provider = PROVIDER, error = %e, "completion request failed");
                return Ok(acc.finish());
            }
        };
        if !resp.status().is_success() {
            tracing::warn!(provider = PROVIDER, status = resp.status().as_u16(), "completion rejected upstream");
            return Ok(acc.finish());
        }

        let drained = drain_events(resp.bytes_stream(), |event| {
            acc.offer(delta_content(&event), TokenUpdate::Add(1))
        })
        .await;
        if let Err(e) = drained {
            tracing::warn!(provider = PROVIDER, error = %e, "completion stream interrupted");
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

    async fn speech(&self, text: &str, options: &SpeechOptions) -> Result<Vec<u8>> {
        let defaults = &self.speech_defaults;
        let model = options
            .model
            .as_deref()
            .or(defaults.model.as_deref())
            .unwrap_or(DEFAULT_TTS_MODEL);
        let voice = options
            .voice
            .as_deref()
            .or(defaults.voice.as_deref())
            .unwrap_or(DEFAULT_TTS_VOICE);
        let speed = options.speed.or(defaults.speed).unwrap_or(DEFAULT_TTS_SPEED);

        tracing::debug!(provider = PROVIDER, model, voice, speed, chars = text.chars().count(), "requesting speech");
        let resp = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": text, "model": model, "voice": voice, "speed": speed }))
            .send()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error(PROVIDER, status.as_u16(), &body));
        }
        let audio = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e))?;
        Ok(audio.to_vec())
    }

    fn supports_speech(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
