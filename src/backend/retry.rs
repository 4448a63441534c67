//! Bounded retry with exponential backoff, per-attempt timeouts, and
//! cancellation.
//!
//! [`Backoff`] is an explicit state machine over `{attempt, delay, ceiling}`:
//! each failure advances it once and yields the next delay, until the
//! ceiling is reached. [`BackendAdapter`] drives it in a plain loop, racing
//! every attempt and every sleep against a [`CancellationToken`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{CompletionOptions, GenerationBackend, Prompt};
use crate::error::BackendError;

/// Retry budget for backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
        }
    }
}

/// Retry state: which attempt is running and how long to wait after it
/// fails.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    delay: Duration,
    policy: RetryPolicy,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempt: 1,
            delay: policy.initial_backoff,
            policy,
        }
    }

    /// The attempt currently running, 1-based.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt. Returns the delay before the next one, or
    /// `None` when the attempt ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts.max(1) {
            return None;
        }
        let delay = self.delay.min(self.policy.max_backoff);
        self.attempt += 1;
        self.delay = (self.delay * 2).min(self.policy.max_backoff);
        Some(delay)
    }
}

/// Wraps a provider with the retry policy and mandatory timeouts.
#[derive(Clone)]
pub struct BackendAdapter {
    backend: Arc<dyn GenerationBackend>,
    policy: RetryPolicy,
}

impl BackendAdapter {
    pub fn new(backend: Arc<dyn GenerationBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Complete `prompt`, retrying transient failures.
    ///
    /// Non-transient errors return immediately. After the last attempt the
    /// final error is returned as-is. Cancellation wins over any in-flight
    /// attempt or backoff sleep.
    pub async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let mut backoff = Backoff::new(self.policy);

        loop {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }

            let attempt = backoff.attempt();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(BackendError::Cancelled),
                r = tokio::time::timeout(options.timeout, self.backend.complete(prompt, options)) => {
                    match r {
                        Ok(inner) => inner,
                        Err(_) => Err(BackendError::Timeout(options.timeout)),
                    }
                }
            };

            let err = match result {
                Ok(text) => {
                    tracing::debug!(backend = self.backend.name(), attempt, "completion succeeded");
                    return Ok(text);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                tracing::warn!(backend = self.backend.name(), attempt, error = %err, "non-transient backend failure");
                return Err(err);
            }

            let Some(delay) = backoff.next_delay() else {
                tracing::warn!(backend = self.backend.name(), attempt, error = %err, "backend retries exhausted");
                return Err(err);
            };

            tracing::info!(
                backend = self.backend.name(),
                attempt,
                ?delay,
                error = %err,
                "transient backend failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn options(timeout: Duration) -> CompletionOptions {
        CompletionOptions {
            model: "m".into(),
            temperature: 0.0,
            max_tokens: 16,
            timeout,
        }
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "s".into(),
            user: "u".into(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        });
        assert_eq!(b.attempt(), 1);
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(250)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(250)));
        assert_eq!(b.attempt(), 5);
        assert_eq!(b.next_delay(), None);
    }

    #[test]
    fn single_attempt_never_retries() {
        let mut b = Backoff::new(fast_policy(1));
        assert_eq!(b.next_delay(), None);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Transient("503".into())),
            Err(BackendError::Transient("503".into())),
            Ok("done".into()),
        ]));
        let adapter = BackendAdapter::new(backend.clone(), fast_policy(3));
        let out = adapter
            .complete(&prompt(), &options(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Transient("first".into())),
            Err(BackendError::Transient("second".into())),
            Ok("too late".into()),
        ]));
        let adapter = BackendAdapter::new(backend.clone(), fast_policy(2));
        let err = adapter
            .complete(&prompt(), &options(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Transient("second".into()));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Fatal("401 unauthorized".into())),
            Ok("never".into()),
        ]));
        let adapter = BackendAdapter::new(backend.clone(), fast_policy(5));
        let err = adapter
            .complete(&prompt(), &options(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Fatal(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok("slow".into()), Ok("slow".into())])
                .with_delay(Duration::from_secs(5)),
        );
        let adapter = BackendAdapter::new(backend.clone(), fast_policy(2));
        let err = adapter
            .complete(&prompt(), &options(Duration::from_millis(20)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(20)));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_call() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok("slow".into())]).with_delay(Duration::from_secs(5)),
        );
        let adapter = BackendAdapter::new(backend, fast_policy(3));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = adapter
            .complete(&prompt(), &options(Duration::from_secs(10)), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_call() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok("x".into())]));
        let adapter = BackendAdapter::new(backend.clone(), fast_policy(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = adapter
            .complete(&prompt(), &options(Duration::from_secs(1)), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Cancelled);
        assert_eq!(backend.calls(), 0);
    }
}
