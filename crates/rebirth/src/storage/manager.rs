use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Pool, Sqlite};

use super::migrations::run_migrations;

pub struct StorageManager;

impl StorageManager {
    /// Open (or create) the database at `db_path` and bring the schema up to
    /// date. Returns the connection pool shared by every store handle.
    pub async fn open(db_path: &Path) -> Result<Pool<Sqlite>> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = sqlx::SqlitePool::connect_with(options).await.map_err(|e| {
            anyhow::anyhow!(
                "Failed to open SQLite database at '{}': {}",
                db_path.display(),
                e
            )
        })?;

        run_migrations(&pool).await?;
        Ok(pool)
    }
}
