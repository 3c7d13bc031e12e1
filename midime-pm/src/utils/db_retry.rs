//! Retry for SQLite lock contention
//!
//! Writes from concurrent ingestions and the precompute job share one SQLite
//! file. `SQLITE_BUSY` surfaces as "database is locked"; those writes are
//! retried with exponential backoff, everything else fails immediately.

use std::future::Future;
use std::time::{Duration, Instant};
use midime_common::{Error, Result};

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;

/// Whether an error is transient lock contention
pub fn is_lock_error(err: &Error) -> bool {
    match err {
        Error::Database(db_err) => {
            let message = db_err.to_string();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

/// Retry a database operation until it succeeds, fails with a non-lock error,
/// or `max_wait_ms` elapses.
///
/// **Algorithm:**
/// 1. Run the operation
/// 2. On a lock error with time remaining: warn, sleep, double the backoff
///    (10ms start, 1000ms cap), retry
/// 3. On a lock error past the deadline: return `Error::Internal`
/// 4. On any other error: return it unchanged
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt: u32 = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Database write succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_lock_error(&err) {
            return Err(err);
        }

        let elapsed = start.elapsed();
        if elapsed >= max_duration {
            tracing::error!(
                operation = operation_name,
                attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                max_wait_ms,
                "Database still locked, giving up"
            );
            return Err(Error::Internal(format!(
                "{}: database locked after {} attempts ({} ms)",
                operation_name,
                attempt,
                elapsed.as_millis()
            )));
        }

        let sleep_ms = backoff_ms.min(max_duration.saturating_sub(elapsed).as_millis() as u64 + 1);
        tracing::warn!(
            operation = operation_name,
            attempt,
            backoff_ms = sleep_ms,
            "Database locked, retrying"
        );
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
    }
}
