//! Bounded retry with exponential backoff, and the cancellation token shared
//! by every cancellable operation in the agent.

use std::future::Future;
use std::time::Duration;

use futures_util::future::select_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// Retry policy for one class of operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Attempts made after the first one.
    pub retries_count: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retries_count: 3,
            delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry_index` (0-based). Doubles each
    /// time and never exceeds `max_delay`.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_index).unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.retries_count.saturating_add(1)
        } else {
            1
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// How an error should be treated by callers that retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retrying may succeed (network, temporary unavailability).
    Transient,
    /// Retrying cannot succeed (not found, integrity mismatch, bad input).
    Permanent,
    /// A supervised process misbehaved.
    Supervision,
    /// The operation was cancelled.
    Cancelled,
}

/// Errors that know their own [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Outcome of a failed [`with_retry`] call.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Cancelled while waiting to retry, or the operation itself was cancelled.
    Cancelled,
    /// Every allowed attempt failed with a transient error.
    Exhausted { attempts: u32, source: E },
    /// The operation failed with an error that is not worth retrying.
    Permanent(E),
}

impl<E> RetryError<E> {
    /// The last operation error, if there was one.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { source, .. } | RetryError::Permanent(source) => Some(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Cancelled => f.write_str("operation cancelled"),
            RetryError::Exhausted { attempts, source } => {
                write!(f, "gave up after {attempts} attempts: {source}")
            }
            RetryError::Permanent(source) => write!(f, "{source}"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { source, .. } | RetryError::Permanent(source) => Some(source),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or
/// `cancel` fires during a backoff wait.
///
/// `op` receives the 1-based attempt number. An attempt that is already
/// running is not interrupted by `cancel`; operations that should stop early
/// must observe the token themselves and report [`ErrorClass::Cancelled`].
pub async fn with_retry<T, E, F, Fut>(
    cfg: &RetryConfig,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Classify + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = cfg.max_attempts();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.class() {
            ErrorClass::Cancelled => return Err(RetryError::Cancelled),
            ErrorClass::Transient => {}
            ErrorClass::Permanent | ErrorClass::Supervision => {
                return Err(RetryError::Permanent(err));
            }
        }

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        let delay = cfg.delay_for(attempt - 1);
        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancellation signal built from one or more `watch::Receiver<bool>`.
///
/// The token is cancelled as soon as any of its receivers observes `true`.
/// A receiver whose sender has gone away never cancels.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    receivers: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { receivers: vec![rx] }
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self::default()
    }

    /// Combine with another signal; either one cancels.
    pub fn with(mut self, rx: watch::Receiver<bool>) -> Self {
        self.receivers.push(rx);
        self
    }

    /// A fresh sender and the token it controls.
    pub fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        self.receivers.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once the token is cancelled. Pends forever if every sender
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receivers = self.receivers.clone();
        loop {
            if receivers.iter().any(|rx| *rx.borrow()) {
                return;
            }
            if receivers.is_empty() {
                std::future::pending::<()>().await;
            }

            let closed = {
                let changes = receivers
                    .iter_mut()
                    .map(|rx| Box::pin(rx.changed()))
                    .collect::<Vec<_>>();
                let (result, index, _rest) = select_all(changes).await;
                result.err().map(|_| index)
            };
            if let Some(index) = closed {
                receivers.swap_remove(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    fn cfg(retries: u32, delay: u64, max: u64) -> RetryConfig {
        RetryConfig {
            enabled: true,
            retries_count: retries,
            delay: Duration::from_secs(delay),
            max_delay: Duration::from_secs(max),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let c = cfg(10, 3, 10);
        assert_eq!(c.delay_for(0), Duration::from_secs(3));
        assert_eq!(c.delay_for(1), Duration::from_secs(6));
        assert_eq!(c.delay_for(2), Duration::from_secs(10));
        assert_eq!(c.delay_for(10), Duration::from_secs(10));
        assert_eq!(c.delay_for(200), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fail_succeed() {
        let c = cfg(2, 3, 10);
        let start = Instant::now();
        let times = Arc::new(std::sync::Mutex::new(Vec::new()));

        let result = with_retry(&c, &CancelToken::never(), |attempt| {
            let times = times.clone();
            async move {
                times.lock().unwrap().push(start.elapsed());
                if attempt < 3 {
                    Err(TestError(ErrorClass::Transient))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        let times = times.lock().unwrap();
        assert_eq!(times.len(), 3);
        let second_delay = times[2] - times[1];
        assert!(second_delay <= Duration::from_secs(10));
        assert_eq!(times[1] - times[0], Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&cfg(2, 1, 5), &CancelToken::never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError(ErrorClass::Transient)) }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&cfg(5, 1, 5), &CancelToken::never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError(ErrorClass::Permanent)) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            with_retry(&RetryConfig::disabled(), &CancelToken::never(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorClass::Transient)) }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let (tx, token) = CancelToken::pair();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let calls = calls.clone();
            tokio::spawn(async move {
                with_retry::<(), _, _, _>(&cfg(5, 60, 300), &token, |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError(ErrorClass::Transient)) }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        let result = task.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_operation_error_maps_to_cancelled() {
        let result: Result<(), _> = with_retry(&cfg(3, 1, 1), &CancelToken::never(), |_| async {
            Err(TestError(ErrorClass::Cancelled))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_token_combines_receivers() {
        let (_tx_a, a) = CancelToken::pair();
        let (tx_b, rx_b) = watch::channel(false);
        let token = a.with(rx_b);
        assert!(!token.is_cancelled());

        tx_b.send(true).unwrap();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_never_cancels() {
        let (tx, token) = CancelToken::pair();
        drop(tx);
        let waited = tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await;
        assert!(waited.is_err());
    }
}
