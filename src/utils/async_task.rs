use std::future::Future;

use tokio::time::sleep;
use tokio::time::timeout;
use tracing::warn;

use crate::BackoffPolicy;
use crate::StoreError;

/// Runs a store call with a per-attempt timeout, retrying transient failures
/// with exponential backoff.
///
/// Non-transient errors are returned immediately. A timed out attempt counts
/// as [`StoreError::Timeout`], which is transient. `max_retries == 0` retries
/// forever; callers bound it by dropping the future.
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    policy: &BackoffPolicy,
    what: &str,
    task: F,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let error = match timeout(policy.timeout(), task()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => error,
            Err(_) => StoreError::Timeout(policy.timeout()),
        };

        if !error.is_transient() {
            return Err(error);
        }

        attempt = attempt.saturating_add(1);
        if policy.max_retries != 0 && attempt as usize > policy.max_retries {
            warn!(what, attempts = attempt, ?error, "giving up after retries");
            return Err(error);
        }

        let delay = policy.delay_for(attempt - 1);
        warn!(what, attempt, ?delay, ?error, "store call failed, retrying");
        sleep(delay).await;
    }
}
