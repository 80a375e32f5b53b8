use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Bounded exponential backoff.
///
/// The n-th retry sleeps `min(delay * backoff^(n-1), max_delay)`; the
/// operation runs at most `tries` times in total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub tries: usize,
    pub delay: Duration,
    pub max_delay: Duration,
    pub backoff: f32,
}

impl RetryPolicy {
    /// Policy used around instance creation: 5 tries, 5s, doubling, capped at 60s.
    pub fn instance_launch() -> Self {
        Self {
            tries: 5,
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff: 2.0,
        }
    }

    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.backoff)
            .with_max_times(self.tries.saturating_sub(1))
    }

    /// Sleeps between consecutive attempts, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.builder().build().collect()
    }

    /// Run `f` until it succeeds or the attempts are exhausted.
    /// The last error is returned as-is.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_when(operation, f, |_| true).await
    }

    /// Like [`run`](Self::run), but stops at the first error for which
    /// `retryable` returns false.
    pub async fn run_when<T, E, F, Fut, R>(
        &self,
        operation: &str,
        f: F,
        retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: FnMut(&E) -> bool,
    {
        let tries = self.tries.max(1);
        let mut retried = 0usize;
        let result = f
            .retry(self.builder())
            .sleep(tokio::time::sleep)
            .when(retryable)
            .notify(|err: &E, delay: Duration| {
                retried += 1;
                warn!(
                    "[retry] {} attempt {}/{} failed: {}; retrying in {:?}",
                    operation, retried, tries, err, delay
                );
            })
            .await;

        if let Err(err) = &result {
            error!(
                "[retry] {} failed after {} attempts: {}",
                operation,
                retried + 1,
                err
            );
        }
        result
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::instance_launch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[test]
    fn instance_launch_schedule() {
        let delays = RetryPolicy::instance_launch().delays();
        assert_eq!(
            delays,
            [5, 10, 20, 40].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            tries: 8,
            ..RetryPolicy::instance_launch()
        };
        let delays = policy.delays();
        assert_eq!(delays.len(), 7);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        assert_eq!(delays.last(), Some(&Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result: Result<&str, String> = RetryPolicy::instance_launch()
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("attempt {n} failed"))
                    } else {
                        Ok("up")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("up"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 5s + 10s of backoff
        assert!(start.elapsed() >= Duration::from_secs(15));
        assert!(start.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_last_error() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result: Result<(), String> = RetryPolicy::instance_launch()
            .run("doomed", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(format!("attempt {n} failed")) }
            })
            .await;

        assert_eq!(result, Err("attempt 5 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(start.elapsed() >= Duration::from_secs(75));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_immediately() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result: Result<(), String> = RetryPolicy::instance_launch()
            .run_when(
                "permanent",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 2 {
                            Err("transient".to_string())
                        } else {
                            Err("permanent".to_string())
                        }
                    }
                },
                |err: &String| err != "permanent",
            )
            .await;

        assert_eq!(result, Err("permanent".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // only the first backoff
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn single_try_does_not_sleep() {
        let policy = RetryPolicy {
            tries: 1,
            ..RetryPolicy::instance_launch()
        };
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = policy
            .run("once", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(policy.delays().is_empty());
    }
}
