//! Retry stage
//!
//! Re-issues an operation after a transient transport failure, waiting an
//! exponentially growing (optionally jittered) delay between attempts. Errors
//! the server reported in a response body are never retried: the operation
//! reached the server and its outcome is final.

use super::{Link, OperationRequest};
use crate::config::RetrySettings;
use crate::types::{GraphqlResponse, Operation, OperationKind, RetryIntent};
use crate::{BoxStream, Error, Result};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retry_mutations: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Deterministic policy (no jitter) that also retries mutations.
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay,
            jitter: false,
            retry_mutations: true,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            min_delay: Duration::from_millis(settings.min_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.min_delay_ms)),
            jitter: settings.jitter,
            retry_mutations: settings.retry_mutations,
        }
    }

    /// A single attempt, never retried.
    pub fn disabled() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_mutations(mut self, retry: bool) -> Self {
        self.retry_mutations = retry;
        self
    }

    /// Whether `operation` is eligible for retries at all.
    pub fn applies_to(&self, operation: &Operation) -> bool {
        if operation.retry_intent() == RetryIntent::Never {
            return false;
        }
        self.retry_mutations || operation.kind() != OperationKind::Mutation
    }

    /// Upper bound of the wait after the `failures`-th failure (0-based):
    /// `min_delay * 2^failures`, capped at `max_delay`.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        Duration::from_millis(min.saturating_mul(factor).min(cap))
    }

    /// Actual wait, with full jitter applied when enabled.
    pub fn backoff(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let ms = base.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
    }
}

pub struct RetryStage<L> {
    policy: RetryPolicy,
    inner: L,
}

impl<L: Link> RetryStage<L> {
    pub fn new(policy: RetryPolicy, inner: L) -> Self {
        Self { policy, inner }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, request: &OperationRequest, attempt_once: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let eligible = self.policy.applies_to(&request.operation);
        let mut attempts = 0u32;
        loop {
            if request.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempts += 1;
            let err = match attempt_once().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(
                            request_id = request.id.as_str(),
                            operation = request.operation.display_name(),
                            attempts,
                            "operation recovered after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !eligible || !err.is_transient() {
                return Err(err);
            }
            if attempts >= self.policy.max_attempts {
                warn!(
                    request_id = request.id.as_str(),
                    operation = request.operation.display_name(),
                    attempts,
                    error = %err,
                    "retries exhausted"
                );
                return Err(Error::RetriesExhausted {
                    attempts,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.backoff(attempts - 1);
            debug!(
                request_id = request.id.as_str(),
                operation = request.operation.display_name(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl<L: Link> Link for RetryStage<L> {
    async fn execute(&self, request: &OperationRequest) -> Result<GraphqlResponse> {
        self.run(request, || self.inner.execute(request)).await
    }

    /// Only establishing the stream is retried; items already delivered are
    /// never replayed.
    async fn subscribe(
        &self,
        request: &OperationRequest,
    ) -> Result<BoxStream<'static, GraphqlResponse>> {
        self.run(request, || self.inner.subscribe(request)).await
    }

    fn stages(&self) -> Vec<&'static str> {
        let mut stages = vec!["retry"];
        stages.extend(self.inner.stages());
        stages
    }
}
