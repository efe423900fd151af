use sqlx::SqlitePool;

use crate::error::Result;

const TABLES: [&str; 2] = ["archive", "metadata"];

/// Create the archive schema on a fresh file.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Raw traffic, one row per request
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS archive (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hashcode TEXT NOT NULL UNIQUE,
            uri TEXT NOT NULL,
            payload TEXT NOT NULL,
            headers TEXT NOT NULL,
            data BLOB NOT NULL,
            created_at REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tag of the fetch that produced the archive; at most one row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            origin TEXT NOT NULL,
            backend_name TEXT NOT NULL,
            backend_version TEXT NOT NULL,
            category TEXT NOT NULL,
            backend_params TEXT NOT NULL,
            created_on TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Whether the file behind `pool` holds both archive tables.
///
/// Files that are not SQLite databases at all fail here with a driver error.
pub async fn has_schema(pool: &SqlitePool) -> Result<bool> {
    for table in TABLES {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            return Ok(false);
        }
    }
    Ok(true)
}
