use std::time::Duration;

use showroom_core::config::DatabaseConfig;
use sqlx::sqlite::SqlitePoolOptions;

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_with_config(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// In-memory databases are per connection, so they are pinned to a single
/// pooled connection that is never reaped or recycled; closing it would drop
/// the whole store.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = if is_memory_url(database_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections.max(1))
    };

    options
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&normalize_url(database_url))
        .await
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn normalize_url(database_url: &str) -> String {
    if database_url == ":memory:" {
        return "sqlite::memory:".to_string();
    }
    if database_url.starts_with("sqlite://")
        && !database_url.contains(":memory:")
        && !database_url.contains('?')
    {
        return format!("{database_url}?mode=rwc");
    }
    database_url.to_string()
}

#[cfg(test)]
mod tests {
    use showroom_core::config::DatabaseConfig;

    use super::{connect, connect_with_config, normalize_url};

    #[test]
    fn file_urls_are_created_on_first_use() {
        assert_eq!(normalize_url("sqlite://showroom.db"), "sqlite://showroom.db?mode=rwc");
        assert_eq!(normalize_url("sqlite://showroom.db?mode=ro"), "sqlite://showroom.db?mode=ro");
        assert_eq!(normalize_url(":memory:"), "sqlite::memory:");
    }

    #[tokio::test]
    async fn memory_pool_is_single_connection() {
        let pool = connect("sqlite::memory:").await.expect("connect");
        let options = pool.options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);
    }

    #[tokio::test]
    async fn file_pool_takes_its_size_from_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("showroom.db").display()),
            max_connections: 3,
            timeout_secs: 5,
        };

        let pool = connect_with_config(&config).await.expect("connect");

        assert_eq!(pool.options().get_max_connections(), 3);
        assert_eq!(pool.options().get_acquire_timeout().as_secs(), 5);
        assert!(pool.options().get_idle_timeout().is_some());
        pool.close().await;
    }
}
