/*!
 * Utility functions and helpers for Device Connect.
 *
 * Bounded waits, retry loops and background task helpers shared by the
 * plugin runtime and the manager.
 */
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Error;

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration)).into()),
    }
}

/// Run a future with a timeout and retry on failure
///
/// # Arguments
///
/// * `duration` - The timeout duration for each attempt
/// * `retries` - The number of retries after the first attempt
/// * `future_factory` - A function that creates a new future for each retry
///
/// # Returns
///
/// The result of the future, or the last error if all retries fail
pub async fn with_retry<F, Fut, T, E>(
    duration: Duration,
    retries: usize,
    mut future_factory: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Error> + Display,
{
    let mut last_error = None;
    let start = Instant::now();

    for i in 0..=retries {
        if i > 0 {
            debug!("Retry {}/{}", i, retries);
        }

        match timeout(duration, future_factory()).await {
            Ok(Ok(result)) => {
                if i > 0 {
                    debug!("Succeeded after {} retries", i);
                }
                return Ok(result);
            }
            Ok(Err(e)) => {
                warn!("Attempt {} failed: {}", i + 1, e);
                last_error = Some(e);
            }
            Err(_) => {
                warn!("Attempt {} timed out", i + 1);
                last_error = Some(Error::timeout("Operation timed out").into());
            }
        }
    }

    warn!("All {} attempts failed after {:?}", retries + 1, start.elapsed());

    Err(last_error.unwrap_or_else(|| Error::other("Unknown error in retry loop").into()))
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_with_timeout_success() {
        let result = tokio_test::block_on(with_timeout(Duration::from_secs(1), async {
            Ok::<_, Error>(42)
        }));
        assert_eq!(tokio_test::assert_ok!(result), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(Duration::from_secs(1), 3, move || {
            let current = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if current < 2 {
                    Err(Error::other("Intentional failure"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_all_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), Error> = with_retry(Duration::from_secs(1), 2, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::other("Intentional failure")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_counts_timeouts() {
        let result: Result<(), Error> = with_retry(Duration::from_millis(5), 1, || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_spawn_and_log() {
        let handle = spawn_and_log("ok", async { Ok::<_, Error>(()) });
        handle.await.unwrap();
        let handle = spawn_and_log("fails", async { Err::<(), _>(Error::other("boom")) });
        handle.await.unwrap();
    }
}
