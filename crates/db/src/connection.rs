use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub type DbPool = sqlx::SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

/// Opens the pool, creating the database file when missing.
///
/// Every connection to `sqlite::memory:` opens its own empty database, so an
/// in-memory URL is pinned to one connection that is never recycled.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let in_memory = is_in_memory(database_url);
    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(timeout_secs.max(1)));
    let pool = if in_memory {
        pool.max_connections(1).min_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        pool.max_connections(max_connections.max(1))
    };

    pool.connect_with(options).await
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::{connect_with_settings, is_in_memory};

    #[test]
    fn recognises_in_memory_urls() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory(":memory:"));
        assert!(is_in_memory("sqlite://shared?mode=memory&cache=shared"));
        assert!(!is_in_memory("sqlite://helmsman.db"));
    }

    #[tokio::test]
    async fn in_memory_pools_share_one_database() {
        let pool = connect_with_settings("sqlite::memory:", 8, 5).await.expect("connect");
        sqlx::query("CREATE TABLE probe (id INTEGER PRIMARY KEY)").execute(&pool).await.expect("create");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM probe")
            .fetch_one(&pool)
            .await
            .expect("table should be visible through the same pool");
        assert_eq!(count, 0);
        assert_eq!(pool.options().get_max_connections(), 1);
        pool.close().await;
    }
}
