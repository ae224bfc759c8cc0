//! PostgreSQL connection pool construction.

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Builds a connection pool from a `postgres://` URL, the way every app in
/// this workspace obtains one at startup.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}
