//! Retry logic with exponential backoff for transient errors.

use crate::context::CancelToken;
use crate::error::{Error, Result};
use crate::types::RetryConfig;
use std::thread;
use std::time::Duration;

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called when an operation is about to be retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Time until the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _error: &Error, _delay: Duration) {}
}

/// Callback that logs retries at warn level.
pub struct LogCallback<'a> {
    pub what: &'a str,
}

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {}ms",
            self.what,
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        );
    }
}

/// Result of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Execute an operation with retry logic.
///
/// Retries only errors whose category is retryable, sleeping with
/// exponential backoff between attempts. A cancelled token stops further
/// attempts; the last error is returned.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    cancel: &CancelToken,
    callback: &dyn RetryCallback,
    mut operation: F,
) -> Retried<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation() {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= max_attempts || cancel.is_cancelled() {
            return Retried {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = config.delay_for_attempt(attempt - 1);
        callback.on_retry(attempt, max_attempts, &err, delay);
        thread::sleep(delay);
    }
}

/// Execute an operation with the default config, no cancellation and no callback.
pub fn with_retry_simple<T, F>(operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    with_retry(
        &RetryConfig::default(),
        &CancelToken::new(),
        &NoCallback,
        operation,
    )
    .result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    fn timeout() -> Error {
        Error::Timeout {
            what: "apply".to_string(),
            after: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_with_retry_success_first_try() {
        let out = with_retry(&RetryConfig::no_retry(), &CancelToken::new(), &NoCallback, || {
            Ok::<_, Error>(42)
        });
        assert_eq!(out.result.unwrap(), 42);
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_with_retry_non_retryable_error() {
        let attempts = Rc::new(Cell::new(0));
        let attempts_clone = attempts.clone();

        let out: Retried<()> = with_retry(&fast_config(3), &CancelToken::new(), &NoCallback, || {
            attempts_clone.set(attempts_clone.get() + 1);
            Err(Error::validation("spec.replicas: must be >= 0"))
        });

        assert!(out.result.is_err());
        assert_eq!(attempts.get(), 1);
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_with_retry_eventual_success() {
        let attempts = Rc::new(Cell::new(0));
        let attempts_clone = attempts.clone();

        let out = with_retry(&fast_config(3), &CancelToken::new(), &NoCallback, || {
            let current = attempts_clone.get();
            attempts_clone.set(current + 1);
            if current < 2 {
                Err(Error::conflict("ConfigMap/media/a", "object has been modified"))
            } else {
                Ok(42)
            }
        });

        assert_eq!(out.result.unwrap(), 42);
        assert_eq!(out.attempts, 3);
    }

    #[test]
    fn test_with_retry_all_attempts_fail() {
        let out: Retried<()> =
            with_retry(&fast_config(3), &CancelToken::new(), &NoCallback, || Err(timeout()));
        assert!(matches!(out.result, Err(Error::Timeout { .. })));
        assert_eq!(out.attempts, 3);
    }

    #[test]
    fn test_with_retry_stops_when_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let out: Retried<()> = with_retry(&fast_config(5), &cancel, &NoCallback, || Err(timeout()));
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_callback_invoked() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingCallback(Arc<AtomicU32>);
        impl RetryCallback for CountingCallback {
            fn on_retry(&self, _: u32, _: u32, _: &Error, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let callback_count = Arc::new(AtomicU32::new(0));
        let callback = CountingCallback(callback_count.clone());

        let _: Retried<()> =
            with_retry(&fast_config(3), &CancelToken::new(), &callback, || Err(timeout()));

        // Called between attempts only: not after the last one
        assert_eq!(callback_count.load(Ordering::SeqCst), 2);
    }
}
