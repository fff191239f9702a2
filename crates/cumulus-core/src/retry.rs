//! Retry combinator with linear back-off.
//!
//! Attempt `n` (0-based) that fails sleeps `step * (n + 1)` before the next
//! one. The last error is returned once `attempts` are exhausted.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Run `op` up to `attempts` times (at least once).
pub async fn retry_linear<T, E, F, Fut>(attempts: u32, step: Duration, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts => {
                warn!(attempt = attempt + 1, error = %e, "operation failed, retrying");
                attempt += 1;
                tokio::time::sleep(step * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
