use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

const STORE_RETRY_ATTEMPTS: u32 = 5;
const STORE_RETRY_BASE: Duration = Duration::from_millis(100);
const STORE_RETRY_MAX: Duration = Duration::from_secs(1);

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.clamp(1, 32))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(opts)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Run a store operation, retrying lock/busy failures with a short exponential
/// backoff (100ms doubling, capped at 1s, at most 5 attempts).
///
/// This is infrastructure retry only and never touches a job's own retry budget.
pub async fn retry_transient<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = STORE_RETRY_BASE;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                tracing::debug!(op, attempt, error = %err, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(STORE_RETRY_MAX);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
