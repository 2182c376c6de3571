//! PostgreSQL connection pool for the pipeline and schedulers.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// How long a caller may wait for a pooled connection. Well under the batch
/// budget, so a saturated pool fails the delivery quickly instead of eating
/// the whole deadline waiting.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Create the connection pool shared by the API handlers, the sweeper, and
/// the re-analyzer.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
}
