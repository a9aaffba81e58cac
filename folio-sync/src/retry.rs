//! Bounded exponential backoff for transient failures.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use tracing::{debug, warn};

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget in `config` is spent. Returns the last error.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    op_name: &str,
    op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    retry_if(config, op_name, SyncError::is_transient, op).await
}

/// Like [`retry_with_backoff`], retrying only errors `should_retry` accepts.
pub async fn retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    op_name: &str,
    should_retry: P,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
    P: Fn(&SyncError) -> bool,
{
    let mut attempt = 0;
    loop {
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug!("[SYNC] Retrying {} in {:?} (attempt {})", op_name, delay, attempt + 1);
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && attempt + 1 < config.max_attempts => {
                warn!("[SYNC] {} failed, will retry: {}", op_name, e);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
