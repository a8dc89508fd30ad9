//! Splits embedding input into provider-sized batches and retries each batch.

use std::future::Future;

use switchboard_types::{GatewayError, Result};

use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::EmbeddingResult;

/// Attempts per batch before the whole call is abandoned.
pub const MAX_BATCH_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct EmbeddingBatcher {
    /// `None` sends every text in a single request.
    batch_size: Option<usize>,
    /// Expected vector length; `None` accepts any.
    dimension: Option<usize>,
    backoff: BackoffPolicy,
}

impl EmbeddingBatcher {
    pub fn new(batch_size: Option<usize>) -> Self {
        Self {
            batch_size: batch_size.filter(|n| *n > 0),
            dimension: None,
            backoff: BackoffPolicy::None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reject batches whose vectors are not `dimension` long. Zero disables the check.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension).filter(|d| *d > 0);
        self
    }

    /// Embed `texts` batch by batch through `embed`, preserving input order.
    ///
    /// A batch counts as successful only when it yields one vector per input
    /// of the configured dimension and a positive token usage. The first batch
    /// to exhaust its attempts, or to be rejected outright by the provider,
    /// aborts the call; later batches are never sent.
    pub async fn run<F, Fut>(
        &self,
        provider: &str,
        texts: &[String],
        mut embed: F,
    ) -> Result<EmbeddingResult>
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = Result<EmbeddingResult>>,
    {
        if texts.is_empty() {
            return Err(GatewayError::validation("text is required"));
        }

        let size = self.batch_size.unwrap_or(texts.len());
        let mut result = EmbeddingResult::default();

        for (index, batch) in texts.chunks(size).enumerate() {
            tracing::debug!(provider, batch = index, size = batch.len(), "embedding batch");
            let what = format!("{provider} embedding batch {index}");
            let expected = batch.len();
            let dimension = self.dimension;
            let mut attempts = 0;

            let embedded = execute_with_retry(
                |attempt| {
                    attempts = attempt + 1;
                    let pending = embed(batch.to_vec());
                    async move { accept_batch(provider, expected, dimension, pending.await?) }
                },
                MAX_BATCH_ATTEMPTS,
                &self.backoff,
                &what,
            )
            .await
            .map_err(|last| GatewayError::EmbeddingBatchExhausted {
                provider: provider.to_string(),
                batch: index,
                attempts,
                message: last_message(&last),
            })?;

            result.embeddings.extend(embedded.embeddings);
            result.total_tokens += embedded.total_tokens;
        }

        Ok(result)
    }
}

fn accept_batch(
    provider: &str,
    expected: usize,
    dimension: Option<usize>,
    batch: EmbeddingResult,
) -> Result<EmbeddingResult> {
    let wrong_dimension = dimension.and_then(|d| {
        batch
            .embeddings
            .iter()
            .map(Vec::len)
            .find(|len| *len != d)
            .map(|len| (d, len))
    });
    let rejection = if batch.embeddings.is_empty() {
        Some("empty embedding list".to_string())
    } else if batch.total_tokens == 0 {
        Some("no token usage reported".to_string())
    } else if batch.embeddings.len() != expected {
        Some(format!(
            "expected {expected} embeddings, got {}",
            batch.embeddings.len()
        ))
    } else if let Some((want, got)) = wrong_dimension {
        Some(format!("expected {want}-dimensional vectors, got {got}"))
    } else {
        None
    };
    match rejection {
        None => Ok(batch),
        Some(message) => Err(GatewayError::UpstreamError {
            provider: provider.to_string(),
            status: 200,
            message,
            retryable: true,
        }),
    }
}

/// Upstream errors carry the provider's own message; prefer that over the full display.
fn last_message(err: &GatewayError) -> String {
    match err {
        GatewayError::UpstreamError { message, .. } | GatewayError::AuthError { message, .. } => {
            message.clone()
        }
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i}")).collect()
    }

    /// Embeds `tN` as `[N]` and reports one token per text.
    fn echo(batch: &[String]) -> EmbeddingResult {
        EmbeddingResult {
            embeddings: batch
                .iter()
                .map(|t| vec![t[1..].parse::<f32>().unwrap()])
                .collect(),
            total_tokens: batch.len() as u64,
        }
    }

    #[tokio::test]
    async fn splits_into_ordered_batches() {
        let calls: Arc<Mutex<Vec<usize>>> = Arc::default();
        let log = calls.clone();
        let batcher = EmbeddingBatcher::new(Some(25));

        let result = batcher
            .run("qwen", &texts(40), move |batch| {
                log.lock().unwrap().push(batch.len());
                async move { Ok(echo(&batch)) }
            })
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![25, 15]);
        assert_eq!(result.embeddings.len(), 40);
        assert_eq!(result.total_tokens, 40);
        for (i, v) in result.embeddings.iter().enumerate() {
            assert_eq!(v[0], i as f32);
        }
    }

    #[tokio::test]
    async fn unbounded_batch_is_single_shot() {
        let calls: Arc<Mutex<usize>> = Arc::default();
        let log = calls.clone();
        let result = EmbeddingBatcher::new(None)
            .run("openai", &texts(40), move |batch| {
                *log.lock().unwrap() += 1;
                async move { Ok(echo(&batch)) }
            })
            .await
            .unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(result.embeddings.len(), 40);
    }

    #[tokio::test]
    async fn exhausted_first_batch_skips_the_rest() {
        let calls: Arc<Mutex<Vec<usize>>> = Arc::default();
        let log = calls.clone();
        let err = EmbeddingBatcher::new(Some(25))
            .run("qwen", &texts(40), move |batch| {
                log.lock().unwrap().push(batch.len());
                async move {
                    Err::<EmbeddingResult, _>(GatewayError::UpstreamError {
                        provider: "qwen".into(),
                        status: 429,
                        message: "Throttling.RateQuota".into(),
                        retryable: true,
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), vec![25; 5]);
        match err {
            GatewayError::EmbeddingBatchExhausted { batch, attempts, message, .. } => {
                assert_eq!(batch, 0);
                assert_eq!(attempts, 5);
                assert_eq!(message, "Throttling.RateQuota");
            }
            other => panic!("expected EmbeddingBatchExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_batch_is_sent_once() {
        let calls: Arc<Mutex<usize>> = Arc::default();
        let log = calls.clone();
        let err = EmbeddingBatcher::new(Some(25))
            .run("openai", &texts(3), move |_| {
                *log.lock().unwrap() += 1;
                async move {
                    Err::<EmbeddingResult, _>(GatewayError::UpstreamError {
                        provider: "openai".into(),
                        status: 400,
                        message: "input too long".into(),
                        retryable: false,
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), 1);
        match err {
            GatewayError::EmbeddingBatchExhausted { attempts, message, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(message, "input too long");
            }
            other => panic!("expected EmbeddingBatchExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_usage_counts_as_failure() {
        let attempts: Arc<Mutex<usize>> = Arc::default();
        let log = attempts.clone();
        let result = EmbeddingBatcher::new(Some(16))
            .run("wenxin", &texts(3), move |batch| {
                let n = {
                    let mut a = log.lock().unwrap();
                    *a += 1;
                    *a
                };
                async move {
                    let mut r = echo(&batch);
                    if n < 3 {
                        r.total_tokens = 0;
                    }
                    Ok(r)
                }
            })
            .await
            .unwrap();
        assert_eq!(*attempts.lock().unwrap(), 3);
        assert_eq!(result.embeddings.len(), 3);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected_until_exhausted() {
        let calls: Arc<Mutex<usize>> = Arc::default();
        let log = calls.clone();
        let err = EmbeddingBatcher::new(Some(16))
            .with_dimension(384)
            .run("wenxin", &texts(2), move |batch| {
                *log.lock().unwrap() += 1;
                async move { Ok(echo(&batch)) }
            })
            .await
            .unwrap_err();
        assert_eq!(*calls.lock().unwrap(), MAX_BATCH_ATTEMPTS);
        match err {
            GatewayError::EmbeddingBatchExhausted { message, .. } => {
                assert_eq!(message, "expected 384-dimensional vectors, got 1");
            }
            other => panic!("expected EmbeddingBatchExhausted, got {other:?}"),
        }

        let ok = EmbeddingBatcher::new(Some(16))
            .with_dimension(1)
            .run("wenxin", &texts(2), |batch| async move { Ok(echo(&batch)) })
            .await
            .unwrap();
        assert_eq!(ok.embeddings.len(), 2);
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let err = EmbeddingBatcher::new(Some(25))
            .run("qwen", &[], |batch| async move { Ok(echo(&batch)) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ValidationError(_)));
    }
}
