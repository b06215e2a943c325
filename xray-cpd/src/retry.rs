//! Retry policy. Wraps the SSH executor with a bounded geometric backoff
//! for transient network errors only.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use xray_cp_common::{AppError, ErrorKind};

/// Default geometric backoff sequence.
pub fn default_backoff() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
    ]
}

/// Run `op` up to `backoff.len() + 1` times. Only `HOST_UNREACHABLE` and
/// `TIMEOUT` are retried; `AUTH_FAILED` and every other kind propagate
/// immediately. `is_cancelled` is polled before sleeping and after waking;
/// if set, the policy fails fast with `JOB_CANCELLED`.
pub async fn with_retry<T, F, Fut>(
    backoff: &[Duration],
    is_cancelled: impl Fn() -> bool,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0usize;
    loop {
        if is_cancelled() {
            return Err(AppError::new(ErrorKind::JobCancelled(
                "cancelled before SSH attempt".into(),
            )));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.kind.is_retryable() || attempt >= backoff.len() {
                    return Err(err);
                }

                if is_cancelled() {
                    return Err(AppError::new(ErrorKind::JobCancelled(
                        "cancelled before retry backoff".into(),
                    )));
                }

                sleep(backoff[attempt]).await;
                attempt += 1;

                if is_cancelled() {
                    return Err(AppError::new(ErrorKind::JobCancelled(
                        "cancelled after retry backoff".into(),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn auth_failed_is_attempted_exactly_once() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&default_backoff(), || false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AppError::new(ErrorKind::AuthFailed)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn host_unreachable_retries_until_budget_exhausted() {
        let calls = AtomicUsize::new(0);
        let backoff = vec![Duration::from_millis(1), Duration::from_millis(1)];
        let result = with_retry(&backoff, || false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AppError::new(ErrorKind::HostUnreachable)) }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_budget() {
        let calls = AtomicUsize::new(0);
        let backoff = vec![Duration::from_millis(1), Duration::from_millis(1)];
        let result = with_retry(&backoff, || false, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::new(ErrorKind::Timeout))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_first_attempt() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&default_backoff(), || true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, AppError>(()) }
        })
        .await;

        assert!(matches!(result, Err(e) if e.kind.is_cancellation()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
