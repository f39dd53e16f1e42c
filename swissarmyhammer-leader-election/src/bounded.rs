//! Blocking I/O with a hard per-attempt timeout and a retry budget
//!
//! A hung network mount can block `read`/`write`/`flock` indefinitely. Every
//! filesystem touch in this crate goes through [`BoundedTaskExecutor::run`], which
//! runs the task on a dedicated blocking pool and stops waiting after the timeout.
//! Cancellation is best effort: an attempt that is already running on a worker
//! keeps running until the OS call returns, its result is simply dropped.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AttemptFailure, ClusterError, Result};

/// Attempt budget for a bounded task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedTaskConfig {
    /// Attempts before giving up, at least one
    pub max_attempts: u32,
    /// How long a single attempt may take
    pub timeout: Duration,
}

/// Runs blocking tasks on a bounded pool with timeouts and retries
#[derive(Debug, Clone)]
pub struct BoundedTaskExecutor {
    pool: Handle,
    config: BoundedTaskConfig,
}

impl BoundedTaskExecutor {
    /// Create an executor submitting attempts to the blocking pool of `pool`
    ///
    /// A zero attempt budget or a zero timeout is rejected.
    pub fn new(pool: Handle, config: BoundedTaskConfig) -> Result<Self> {
        if config.max_attempts == 0 {
            return Err(ClusterError::invalid_config(
                "task_max_attempts",
                "must be greater than 0",
            ));
        }
        if config.timeout.is_zero() {
            return Err(ClusterError::invalid_config(
                "task_timeout",
                "must be greater than 0",
            ));
        }
        Ok(Self { pool, config })
    }

    /// The attempt budget
    pub fn config(&self) -> BoundedTaskConfig {
        self.config
    }

    /// Run `task` until it succeeds or the attempt budget is spent.
    ///
    /// Returns `Ok(Some(value))` on the first successful attempt, and
    /// `Ok(None)` when `cancel` fires while waiting, which callers treat as
    /// "try again next cycle". The failure of the last attempt is returned as
    /// [`ClusterError::BoundedTask`]. Each attempt calls `task` afresh.
    pub async fn run<T, F>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        task: F,
    ) -> Result<Option<T>>
    where
        F: Fn() -> io::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let task = Arc::new(task);
        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                debug!("Task '{}' cancelled before attempt {}", name, attempt);
                return Ok(None);
            }

            let attempt_task = Arc::clone(&task);
            let mut handle = self.pool.spawn_blocking(move || (*attempt_task)());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = tokio::time::timeout(self.config.timeout, &mut handle) => Some(outcome),
            };

            let failure = match outcome {
                None => {
                    handle.abort();
                    debug!("Task '{}' cancelled during attempt {}", name, attempt);
                    return Ok(None);
                }
                Some(Ok(Ok(Ok(value)))) => return Ok(Some(value)),
                Some(Ok(Ok(Err(e)))) => AttemptFailure::Failed(e),
                Some(Ok(Err(join_error))) => AttemptFailure::Aborted(join_error.to_string()),
                Some(Err(_elapsed)) => {
                    handle.abort();
                    AttemptFailure::TimedOut(self.config.timeout)
                }
            };

            if attempt >= max_attempts {
                return Err(ClusterError::BoundedTask {
                    task: name.to_string(),
                    attempts: attempt,
                    source: failure,
                });
            }

            warn!(
                "Task '{}' attempt {}/{} failed: {}",
                name, attempt, max_attempts, failure
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_attempts: u32, timeout_ms: u64) -> BoundedTaskExecutor {
        BoundedTaskExecutor::new(
            Handle::current(),
            BoundedTaskConfig {
                max_attempts,
                timeout: Duration::from_millis(timeout_ms),
            },
        )
        .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_zero_budget_is_rejected() {
        let zero_attempts = BoundedTaskExecutor::new(
            Handle::current(),
            BoundedTaskConfig {
                max_attempts: 0,
                timeout: Duration::from_secs(1),
            },
        );
        assert!(matches!(
            zero_attempts,
            Err(ClusterError::InvalidConfig { ref key, .. }) if key == "task_max_attempts"
        ));

        let zero_timeout = BoundedTaskExecutor::new(
            Handle::current(),
            BoundedTaskConfig {
                max_attempts: 1,
                timeout: Duration::ZERO,
            },
        );
        assert!(matches!(
            zero_timeout,
            Err(ClusterError::InvalidConfig { ref key, .. }) if key == "task_timeout"
        ));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_success_returns_after_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = executor(3, 1000)
            .run("ok", &CancellationToken::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(result, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_failure_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = executor(3, 1000)
            .run("flaky", &CancellationToken::new(), move || {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(io::Error::new(io::ErrorKind::Other, "transient"))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(result, Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_last_failure_is_propagated() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = executor(2, 1000)
            .run("broken", &CancellationToken::new(), move || -> io::Result<()> {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::new(io::ErrorKind::Other, format!("failure {}", n)))
            })
            .await
            .unwrap_err();

        match err {
            ClusterError::BoundedTask {
                task,
                attempts,
                source: AttemptFailure::Failed(e),
            } => {
                assert_eq!(task, "broken");
                assert_eq!(attempts, 2);
                assert_eq!(e.to_string(), "failure 1");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_hanging_task_is_attempted_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = executor(3, 20)
            .run("hang", &CancellationToken::new(), move || -> io::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClusterError::BoundedTask {
                attempts: 3,
                source: AttemptFailure::TimedOut(_),
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_panicking_task_counts_as_failed_attempt() {
        let err = executor(1, 1000)
            .run("panic", &CancellationToken::new(), || -> io::Result<()> {
                panic!("boom")
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClusterError::BoundedTask {
                source: AttemptFailure::Aborted(_),
                ..
            }
        ));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_cancellation_returns_no_result() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = executor(5, 5000)
            .run("slow", &cancel, || -> io::Result<()> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap();

        assert!(result.is_none());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_already_cancelled_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = executor(3, 1000)
            .run("skipped", &cancel, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
