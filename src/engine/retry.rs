use std::future::Future;

use super::EngineError;

/// Re-run `op` on optimistic-concurrency conflicts, up to `max_attempts`
/// total attempts. Every attempt starts from a fresh read inside `op`, so a
/// retry observes whatever the winning writer committed. Business errors are
/// returned immediately; the attempt bound keeps contention storms from
/// live-locking callers.
pub async fn with_retries<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    debug_assert!(max_attempts > 0);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::debug!("attempt {attempt} lost an optimistic commit, retrying: {e}");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use ulid::Ulid;

    #[tokio::test]
    async fn succeeds_after_conflicts() {
        let calls = AtomicU32::new(0);
        let result = with_retries(5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::VersionConflict(Ulid::nil()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::VersionConflict(Ulid::nil())) }
        })
        .await;
        assert_eq!(result, Err(EngineError::VersionConflict(Ulid::nil())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::WaitlistFull(Ulid::nil())) }
        })
        .await;
        assert_eq!(result, Err(EngineError::WaitlistFull(Ulid::nil())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
