//! Baidu Qianfan (Wenxin / ERNIE) adapter.
//!
//! Every request is authorized with an `access_token` query parameter obtained
//! from the OAuth client-credentials exchange and kept in a [`CredentialCache`].
//! A rejected token (HTTP 401 or error codes 110/111) is dropped from the cache;
//! completions then retry once with a fresh token.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use switchboard_types::{GatewayError, PlatformConfig, PlatformKey, Result};

use crate::credentials::{CachedToken, CredentialCache};
use crate::embedding::EmbeddingBatcher;
use crate::framer::{drain_events, Accumulator, Flow, TokenUpdate};
use crate::normalize::{MessageShape, Normalized};
use crate::openai::vector;
use crate::provider::{http_error, merge_extra, resolve_model};
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::tokens::TokenCounter;
use crate::{ChunkFn, CompletionOptions, CompletionResult, EmbeddingResult, Message, PlatformAdapter};

const PROVIDER: &str = "wenxin";
const DEFAULT_BASE_URL: &str = "https://aip.baidubce.com";
const WORKSHOP_PATH: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop";
const TOKEN_PATH: &str = "/oauth/2.0/token";
const EMBEDDING_PATH: &str = "/embeddings/embedding-v1";
const EMBEDDING_BATCH_SIZE: usize = 16;
const TOKEN_ATTEMPTS: usize = 3;
const BASE_DELAY: Duration = Duration::from_millis(500);

/// `Access token invalid or no longer valid` / `Access token expired`.
const INVALID_TOKEN_CODES: [i64; 2] = [110, 111];

pub const WENXIN_MODELS: &[&str] = &["ERNIE-Bot-4", "ERNIE-Bot-turbo", "ERNIE-Bot"];

fn model_path(model: &str) -> Option<&'static str> {
    match model {
        "ERNIE-Bot-4" => Some("/chat/completions_pro"),
        "ERNIE-Bot-turbo" => Some("/chat/completions"),
        "ERNIE-Bot" => Some("/chat/eb-instant"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// WenxinAdapter
// ---------------------------------------------------------------------------

pub struct WenxinAdapter {
    client_id: String,
    client_secret: String,
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialCache>,
    token_backoff: BackoffPolicy,
    batcher: EmbeddingBatcher,
}

impl fmt::Debug for WenxinAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WenxinAdapter")
            .field("client_id", &"***")
            .field("client_secret", &"***")
            .field("base_url", &self.base_url)
            .field("token_backoff", &self.token_backoff)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Finished,
    TokenRejected,
}

impl WenxinAdapter {
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let (Some(client_id), Some(client_secret)) =
            (present(config.client_id), present(config.client_secret))
        else {
            return Err(GatewayError::Configuration {
                provider: PROVIDER.into(),
                message: "Wenxin client_id or client_secret is required".into(),
            });
        };
        let base_url = config
            .base_path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let backoff = BackoffPolicy::Linear(BASE_DELAY);
        Ok(Self {
            client_id,
            client_secret,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: Arc::new(CredentialCache::new()),
            batcher: EmbeddingBatcher::new(Some(EMBEDDING_BATCH_SIZE))
                .with_dimension(config.dimension)
                .with_backoff(backoff.clone()),
            token_backoff: backoff,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(PlatformConfig::from_env(PlatformKey::Wenxin))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Delay policy for both token exchange and embedding retries.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.batcher = self.batcher.with_backoff(backoff.clone());
        self.token_backoff = backoff;
        self
    }

    /// Share one token cache between adapters using the same credentials.
    pub fn with_credential_cache(mut self, cache: Arc<CredentialCache>) -> Self {
        self.credentials = cache;
        self
    }

    pub fn credential_cache(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    fn workshop_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, WORKSHOP_PATH, path)
    }

    // -- Auth ---------------------------------------------------------------

    async fn exchange_token(&self) -> Result<CachedToken> {
        let auth_error = |message: String| GatewayError::AuthError {
            provider: PROVIDER.into(),
            message,
        };
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, TOKEN_PATH))
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| auth_error(format!("token request failed: {}", e.without_url())))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(auth_error(format!("token endpoint returned HTTP {}", status.as_u16())));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| auth_error(format!("token response unreadable: {}", e.without_url())))?;

        match body["access_token"].as_str().filter(|t| !t.is_empty()) {
            Some(token) => {
                let expires_in = body["expires_in"].as_i64();
                tracing::debug!(provider = PROVIDER, expires_in = ?expires_in, "access token exchanged");
                Ok(CachedToken::new(token, expires_in))
            }
            None => Err(auth_error(
                body["error_description"]
                    .as_str()
                    .unwrap_or("no access_token in response")
                    .to_string(),
            )),
        }
    }

    /// A valid token from the cache, exchanging credentials when needed.
    async fn access_token(&self) -> Result<String> {
        self.credentials
            .get_or_fetch(|| {
                execute_with_retry(
                    |_| self.exchange_token(),
                    TOKEN_ATTEMPTS,
                    &self.token_backoff,
                    "wenxin token exchange",
                )
            })
            .await
    }

    // -- Completion ---------------------------------------------------------

    fn build_request_body(model: &str, normalized: &Normalized, options: &CompletionOptions) -> Value {
        let mut body = json!({
            "model": model,
            "messages": normalized.messages,
            "stream": true,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = options.penalty_score {
            body["penalty_score"] = json!(p);
        }
        if let Some(system) = &normalized.system {
            body["system"] = json!(system);
        }
        merge_extra(&mut body, &options.extra);
        body
    }

    async fn stream_once(
        &self,
        url: &str,
        token: &str,
        body: &Value,
        acc: &mut Accumulator<'_, '_>,
    ) -> StreamEnd {
        let resp = match self
            .client
            .post(url)
            .query(&[("access_token", token)])
            .json(body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(provider = PROVIDER, error = %e.without_url(), "completion request failed");
                return StreamEnd::Finished;
            }
        };
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return StreamEnd::TokenRejected;
        }
        if resp.status() != reqwest::StatusCode::OK {
            tracing::warn!(provider = PROVIDER, status = resp.status().as_u16(), "completion rejected upstream");
            return StreamEnd::Finished;
        }

        let mut rejected = false;
        let drained = drain_events(resp.bytes_stream(), |event| {
            if let Some(code) = event["error_code"].as_i64() {
                if INVALID_TOKEN_CODES.contains(&code) {
                    rejected = true;
                } else {
                    tracing::warn!(
                        provider = PROVIDER,
                        code,
                        message = event["error_msg"].as_str().unwrap_or_default(),
                        "completion returned an error"
                    );
                }
                return Flow::Stop;
            }
            let delta = event["result"].as_str().unwrap_or_default();
            let tokens = event["usage"]["total_tokens"].as_u64().unwrap_or(0);
            if acc.offer(delta, TokenUpdate::Add(tokens)) == Flow::Stop {
                return Flow::Stop;
            }
            if event["is_end"].as_bool() == Some(true) {
                Flow::Stop
            } else {
                Flow::Continue
            }
        })
        .await;
        if let Err(e) = drained {
            tracing::warn!(provider = PROVIDER, error = %e.without_url(), "completion stream interrupted");
        }

        if rejected {
            StreamEnd::TokenRejected
        } else {
            StreamEnd::Finished
        }
    }

    // -- Embedding ----------------------------------------------------------

    async fn embed_batch(&self, batch: Vec<String>) -> Result<EmbeddingResult> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .post(self.workshop_url(EMBEDDING_PATH))
            .query(&[("access_token", token.as_str())])
            .json(&json!({ "input": batch }))
            .send()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e.without_url()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::transport(PROVIDER, e.without_url()))?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.credentials.invalidate().await;
        }
        if status != reqwest::StatusCode::OK {
            return Err(http_error(PROVIDER, status.as_u16(), &text));
        }

        let body: Value = serde_json::from_str(&text)?;
        if let Some(code) = body["error_code"].as_i64() {
            if INVALID_TOKEN_CODES.contains(&code) {
                self.credentials.invalidate().await;
            }
            return Err(GatewayError::UpstreamError {
                provider: PROVIDER.into(),
                status: status.as_u16(),
                message: body["error_msg"].as_str().unwrap_or_default().to_string(),
                retryable: true,
            });
        }
        Ok(parse_embeddings(&body))
    }
}

fn parse_embeddings(body: &Value) -> EmbeddingResult {
    EmbeddingResult {
        embeddings: body["data"]
            .as_array()
            .map(|xs| xs.iter().map(|x| vector(&x["embedding"])).collect())
            .unwrap_or_default(),
        total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0),
    }
}

// ---------------------------------------------------------------------------
// PlatformAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl PlatformAdapter for WenxinAdapter {
    fn key(&self) -> PlatformKey {
        PlatformKey::Wenxin
    }

    fn label(&self) -> &str {
        "文心一言(千帆)"
    }

    fn models(&self) -> &[&'static str] {
        WENXIN_MODELS
    }

    fn count_tokens(&self, text: &str) -> usize {
        TokenCounter::for_platform(PlatformKey::Wenxin).count(text)
    }

    async fn completion(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        on_chunk: Option<&mut ChunkFn<'_>>,
    ) -> Result<CompletionResult> {
        let normalized = MessageShape::StrictAlternation.normalize(messages)?;
        let model = resolve_model(WENXIN_MODELS, &options.model, false);
        let path = model_path(model).ok_or_else(|| GatewayError::validation("model not found"))?;
        let url = self.workshop_url(path);
        let body = Self::build_request_body(model, &normalized, options);

        let token = self.access_token().await?;
        let mut acc = Accumulator::new(on_chunk);

        tracing::debug!(provider = PROVIDER, model, messages = normalized.messages.len(), "sending completion");
        if self.stream_once(&url, &token, &body, &mut acc).await == StreamEnd::TokenRejected {
            tracing::debug!(provider = PROVIDER, "access token rejected, refreshing");
            self.credentials.invalidate().await;
            match self.access_token().await {
                Ok(fresh) => {
                    if self.stream_once(&url, &fresh, &body, &mut acc).await == StreamEnd::TokenRejected {
                        tracing::warn!(provider = PROVIDER, "refreshed access token was rejected");
                        self.credentials.invalidate().await;
                    }
                }
                Err(e) => tracing::warn!(provider = PROVIDER, error = %e, "access token refresh failed"),
            }
        }

        let cancelled = acc.is_cancelled();
        let result = acc.finish();
        tracing::debug!(provider = PROVIDER, tokens = result.total_tokens, cancelled, "completion finished");
        Ok(result)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Err(GatewayError::validation("text is required"));
        }
        // Credential failures surface as-is rather than as an exhausted batch.
        self.access_token().await?;
        self.batcher
            .run(PROVIDER, texts, |batch| self.embed_batch(batch))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
