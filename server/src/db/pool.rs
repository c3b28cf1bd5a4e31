//! Database connection pool management.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Type alias for the database pool.
pub type Pool = SqlitePool;

/// Create a new database connection pool, creating the file if needed.
///
/// An in-memory database lives in a single connection that is never
/// recycled, so every query sees the same data.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    pool.connect_with(options).await
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
