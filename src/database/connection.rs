//! Connection pool setup with bounded boot-time retries.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::Result;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Connect a pool sized for the worker pool plus the poller. Retries a few
/// times so the service survives a database that is still coming up; if the
/// database stays unreachable the boot fails.
pub async fn connect_pool(database_url: &str, max_workers: usize) -> Result<PgPool> {
    // One connection per worker, one for the poller, one spare for
    // startup-recovery traffic.
    let max_connections = (max_workers + 2) as u32;

    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1").execute(&pool).await?;
                info!(max_connections, "database pool ready");
                return Ok(pool);
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = CONNECT_ATTEMPTS,
                    error = %e,
                    "database connection failed"
                );
                last_err = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
    }

    Err(last_err.expect("at least one connect attempt").into())
}
