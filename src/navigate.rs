use crate::config::DownloadSettings;
use crate::error::EngineError;
use chromiumoxide::Page;
use log::warn;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Retry schedule: linear backoff scaled by the attempt number, plus a small
/// random jitter so parallel walkers do not hammer in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &DownloadSettings) -> Self {
        Self {
            max_attempts: settings.nav_attempts.max(1),
            base_delay: Duration::from_millis(settings.nav_backoff_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..250);
        self.base_delay * attempt + Duration::from_millis(jitter)
    }
}

/// Run `op` until it succeeds or the attempt ceiling is hit, surfacing the
/// last error. Cancellation is never retried.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!("{}: attempt {}/{} failed: {}", label, attempt, max, err);
                if attempt >= max {
                    return Err(err);
                }
                sleep(policy.backoff(attempt)).await;
            }
        }
    }
}

/// Navigate `page` to `url`, waiting for the DOM to settle, with a
/// per-attempt timeout and the configured retry schedule. Full network
/// idleness is deliberately not awaited; the interception policy blocks most
/// subresources anyway.
pub async fn navigate(page: &Page, url: &str, settings: &DownloadSettings) -> Result<(), EngineError> {
    let policy = RetryPolicy::from_settings(settings);
    let per_attempt = Duration::from_millis(settings.nav_timeout_ms);
    with_retry(url, policy, || async {
        timeout(per_attempt, async {
            page.goto(url)
                .await
                .map_err(|e| EngineError::navigation(url, e))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| EngineError::navigation(url, e))?;
            Ok(())
        })
        .await
        .map_err(|_| {
            EngineError::navigation(url, format!("timed out after {}ms", settings.nav_timeout_ms))
        })?
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::navigation("http://x", "transient"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test", policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::navigation("http://x", "down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test", policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Cancelled) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
