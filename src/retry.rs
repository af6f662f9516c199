//! Transparent retry of broker-not-ready failures.
//!
//! One logical call may need several round trips before a leader is elected
//! or a coordinator finishes loading. Callers describe a single attempt; the
//! driver repeats it with capped exponential backoff while the failure is
//! transient and hands back the first success or terminal error.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF};
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempt ceiling including the first try; `None` retries until success.
    pub max_attempts: Option<u32>,
    #[serde(rename = "initialBackoffMs", with = "millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "maxBackoffMs", with = "millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Fixed short delay, handy for tests and local clusters.
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ClientError::Configuration(format!(
                "retry multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ClientError::Configuration(
                "initialBackoffMs must not exceed maxBackoffMs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn start(&self, operation: &'static str) -> RetryState {
        RetryState {
            policy: self.clone(),
            operation,
            attempts: 0,
            delay: self.initial_backoff,
            cancel: None,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.start(operation).run(f).await
    }

    pub async fn run_if<T, F, Fut, C>(&self, operation: &'static str, retryable: C, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&ClientError) -> bool,
    {
        self.start(operation).run_if(retryable, f).await
    }
}

/// Progress of one logical call through the retry policy.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    operation: &'static str,
    attempts: u32,
    delay: Duration,
    cancel: Option<CancellationToken>,
}

impl RetryState {
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failed attempt and waits before the next one. Returns the
    /// error itself when it is terminal, or `RetriesExhausted` once the
    /// attempt ceiling is hit.
    pub async fn backoff(&mut self, err: ClientError) -> Result<()> {
        let retryable = err.is_transient();
        self.backoff_if(err, retryable).await
    }

    pub async fn backoff_if(&mut self, err: ClientError, retryable: bool) -> Result<()> {
        self.record_if(&err, retryable)?;

        debug!(
            "{} not ready ({}), retrying in {:?} (attempt {})",
            self.operation, err, self.delay, self.attempts
        );
        let delay = self.delay;
        self.delay = self.next_delay();

        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    /// Counts a failed attempt without waiting, for callers that retry on
    /// their own schedule.
    pub fn record(&mut self, err: &ClientError) -> Result<()> {
        self.record_if(err, err.is_transient())
    }

    fn record_if(&mut self, err: &ClientError, retryable: bool) -> Result<()> {
        self.attempts += 1;
        if !retryable {
            return Err(err.clone());
        }
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                warn!(
                    "{} failed after {} attempts: {}",
                    self.operation, self.attempts, err
                );
                return Err(ClientError::RetriesExhausted {
                    operation: self.operation,
                    attempts: self.attempts,
                    last: Box::new(err.clone()),
                });
            }
        }
        Ok(())
    }

    pub async fn run<T, F, Fut>(self, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(ClientError::is_transient, f).await
    }

    pub async fn run_if<T, F, Fut, C>(mut self, retryable: C, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&ClientError) -> bool,
    {
        loop {
            if matches!(&self.cancel, Some(token) if token.is_cancelled()) {
                return Err(ClientError::Cancelled);
            }
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let should_retry = retryable(&err);
                    self.backoff_if(err, should_retry).await?;
                }
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let cap = self.policy.max_backoff;
        let scaled = self.delay.as_secs_f64() * self.policy.multiplier.max(1.0);
        if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
            return cap;
        }
        Duration::try_from_secs_f64(scaled).map_or(cap, |delay| delay.min(cap))
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(1), max_attempts)
    }

    #[tokio::test]
    async fn transient_failures_are_absorbed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = quick(None)
            .run("fetch", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(ClientError::BrokerNotReady)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = quick(None)
            .run("fetch", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::TopicDoesNotExist) }
            })
            .await;
        assert_eq!(result, Err(ClientError::TopicDoesNotExist));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ceiling_reports_exhaustion() {
        let result: Result<()> = quick(Some(3))
            .run("commit", || async { Err(ClientError::Timeout) })
            .await;
        match result {
            Err(ClientError::RetriesExhausted { operation, attempts, last }) => {
                assert_eq!(operation, "commit");
                assert_eq!(attempts, 3);
                assert_eq!(*last, ClientError::Timeout);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::fixed(Duration::from_secs(60), None);
        let state = policy.start("join").cancel_on(token.clone());
        token.cancel();
        let result: Result<()> = state.run(|| async { Err(ClientError::BrokerNotReady) }).await;
        assert_eq!(result, Err(ClientError::Cancelled));
    }

    #[test]
    fn backoff_grows_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        };
        let mut state = policy.start("op");
        state.delay = state.next_delay();
        assert_eq!(state.delay, Duration::from_millis(200));
        state.delay = state.next_delay();
        assert_eq!(state.delay, Duration::from_millis(300));
    }

    #[test]
    fn huge_multiplier_saturates_at_cap() {
        let policy = RetryPolicy {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 1e300,
        };
        let mut state = policy.start("op");
        for _ in 0..3 {
            state.delay = state.next_delay();
            assert_eq!(state.delay, Duration::from_secs(2));
        }
    }

    #[test]
    fn multiplier_below_one_is_rejected() {
        let policy = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(ClientError::Configuration(_))));
        assert!(RetryPolicy { multiplier: f64::INFINITY, ..RetryPolicy::default() }
            .validate()
            .is_err());
        assert_eq!(RetryPolicy::default().validate(), Ok(()));
    }

    #[test]
    fn record_counts_without_sleeping() {
        let lost = ClientError::CoordinatorNotAvailable { group_id: "g".into() };
        let mut state = quick(Some(2)).start("heartbeat");
        assert_eq!(state.record(&lost), Ok(()));
        assert!(matches!(
            state.record(&lost),
            Err(ClientError::RetriesExhausted { attempts: 2, .. })
        ));
        let mut state = quick(None).start("heartbeat");
        assert_eq!(
            state.record(&ClientError::UnknownMemberId),
            Err(ClientError::UnknownMemberId)
        );
    }

    #[test]
    fn policy_reads_millisecond_fields() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"maxAttempts":5,"initialBackoffMs":10,"maxBackoffMs":50}"#)
                .unwrap();
        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(policy.max_backoff, Duration::from_millis(50));
        assert_eq!(policy.multiplier, DEFAULT_BACKOFF_MULTIPLIER);
    }
}
