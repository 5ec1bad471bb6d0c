//! Rate-limited inference client: the single choke point for service calls.
//!
//! ## Retry policy
//!
//! `Throttled` and `Transient` failures are retried with exponential backoff
//! (`base_delay_ms * 2^(n-1)`, capped at `max_delay_ms`) until
//! `max_attempts` calls have been made; the final failure is wrapped in
//! [`InferenceError::RetriesExhausted`]. `Fatal` and malformed-response
//! failures return immediately.
//!
//! ## Shared backoff state
//!
//! [`BackoffState`] is shared by every clone of the client. A throttled
//! request raises an adaptive delay floor that other requests' *retries*
//! respect; each success decays it. The floor only stretches retry sleeps,
//! so first attempts are never delayed and unrelated requests never wait on
//! each other.

use super::{InferenceRequest, InferenceResponse, InferenceService};
use crate::config::BackoffConfig;
use crate::error::InferenceError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Source of retry delays. Tests inject a recording implementation.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Backoff state shared across concurrent callers. All updates are atomic.
#[derive(Debug, Default)]
pub struct BackoffState {
    floor_ms: AtomicU64,
    throttle_events: AtomicU64,
    retries: AtomicU64,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current adaptive minimum retry delay.
    pub fn floor_ms(&self) -> u64 {
        self.floor_ms.load(Ordering::Acquire)
    }

    /// Throttling responses seen so far.
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::Relaxed)
    }

    /// Retries scheduled so far.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    fn record_throttle(&self, delay_ms: u64) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
        self.floor_ms.fetch_max(delay_ms, Ordering::AcqRel);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        let _ = self
            .floor_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                (f > 0).then_some(f / 2)
            });
    }
}

/// Wraps an [`InferenceService`] with retry, backoff and an optional cap on
/// in-flight calls. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RateLimitedClient {
    inner: Arc<dyn InferenceService>,
    policy: BackoffConfig,
    state: Arc<BackoffState>,
    sleeper: Arc<dyn Sleeper>,
    permits: Option<Arc<Semaphore>>,
}

impl RateLimitedClient {
    pub fn new(inner: Arc<dyn InferenceService>, policy: BackoffConfig) -> Self {
        Self {
            inner,
            policy,
            state: Arc::new(BackoffState::new()),
            sleeper: Arc::new(TokioSleeper),
            permits: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Share backoff state with another client.
    pub fn with_state(mut self, state: Arc<BackoffState>) -> Self {
        self.state = state;
        self
    }

    /// Allow at most `n` calls to the service at once.
    pub fn with_max_inflight(mut self, n: usize) -> Self {
        self.permits = Some(Arc::new(Semaphore::new(n.max(1))));
        self
    }

    pub fn state(&self) -> &Arc<BackoffState> {
        &self.state
    }

    pub fn policy(&self) -> &BackoffConfig {
        &self.policy
    }

    /// Call the service, retrying retryable failures per the backoff policy.
    pub async fn invoke(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, InferenceError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut prev_delay = 0u64;
        let mut attempt = 1u32;

        loop {
            let result = {
                let _permit = match &self.permits {
                    Some(sem) => Some(sem.acquire().await.map_err(|_| InferenceError::Fatal {
                        detail: "inference permit pool closed".into(),
                    })?),
                    None => None,
                };
                self.inner.invoke(request).await
            };

            let err = match result {
                Ok(response) => {
                    self.state.record_success();
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", request.task, attempt);
                    }
                    return Ok(response);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(
                    "{}: giving up after {} attempts: {}",
                    request.task, attempt, err
                );
                return Err(InferenceError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.next_delay(attempt, prev_delay, &err);
            if matches!(err, InferenceError::Throttled { .. }) {
                self.state.record_throttle(delay);
            }
            self.state.record_retry();
            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {}ms",
                request.task, attempt, max_attempts, err, delay
            );

            self.sleeper.sleep(Duration::from_millis(delay)).await;
            prev_delay = delay;
            attempt += 1;
        }
    }

    /// Delay before retry number `retry`: the exponential step, raised to the
    /// shared floor, the server's hint and the previous delay, then capped.
    fn next_delay(&self, retry: u32, prev_delay: u64, err: &InferenceError) -> u64 {
        let hint = match err {
            InferenceError::Throttled {
                retry_after_ms: Some(ms),
                ..
            } => *ms,
            _ => 0,
        };
        self.policy
            .delay_for_retry(retry)
            .max(self.state.floor_ms())
            .max(hint)
            .max(prev_delay)
            .min(self.policy.max_delay_ms)
    }

    /// Invoke a chat task and return its text.
    pub async fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        self.invoke(request).await?.into_text()
    }

    /// Embed `texts` in one request.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, InferenceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();
        let vectors = self
            .invoke(&InferenceRequest::embed(texts))
            .await?
            .into_embeddings()?;
        if vectors.len() != expected {
            return Err(InferenceError::UnexpectedResponse {
                detail: format!("asked for {} embeddings, got {}", expected, vectors.len()),
            });
        }
        Ok(vectors)
    }

    /// Embed `texts` in batches of `batch_size`, preserving order.
    pub async fn embed_batched(
        &self,
        texts: Vec<String>,
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>, InferenceError> {
        let batch_size = batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        let mut rest = texts;
        while !rest.is_empty() {
            let tail = rest.split_off(batch_size.min(rest.len()));
            out.extend(self.embed(rest).await?);
            rest = tail;
        }
        Ok(out)
    }
}

#[async_trait]
impl InferenceService for RateLimitedClient {
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        RateLimitedClient::invoke(self, request).await
    }
}
