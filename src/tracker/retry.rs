//! Bounded retry with exponential backoff for event-log writes.
//!
//! Transient transport errors (connection resets, pool timeouts) are worth
//! retrying; integrity violations and stage-machine rejections are not and
//! surface immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Run `op` up to [`MAX_ATTEMPTS`] times, doubling the backoff between
/// attempts while the error stays transient.
pub async fn with_retries<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = INITIAL_BACKOFF;

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient database error, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("retry loop returns on the final attempt")
}
