use anyhow::Result;
use sqlx::{Pool, Sqlite};
use tracing::info;

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version < CURRENT_SCHEMA_VERSION {
        info!(
            "Running database migrations from v{} to v{}...",
            current_version, CURRENT_SCHEMA_VERSION
        );

        for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
            apply_migration(pool, version).await?;
            update_schema_version(pool, version).await?;
            info!("  migration v{} complete", version);
        }
    }

    Ok(())
}

async fn get_schema_version(pool: &Pool<Sqlite>) -> Result<i32> {
    let table_exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT name FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
    "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version = sqlx::query_scalar::<_, i32>("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;

    Ok(version)
}

async fn update_schema_version(pool: &Pool<Sqlite>, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn apply_migration(pool: &Pool<Sqlite>, version: i32) -> Result<()> {
    match version {
        1 => {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )
            "#,
            )
            .execute(pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE users (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL COLLATE NOCASE UNIQUE,
                    password_hash TEXT NOT NULL DEFAULT '',
                    token_version INTEGER NOT NULL DEFAULT 0,
                    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )
            "#,
            )
            .execute(pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE game_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    wish TEXT NOT NULL,
                    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                    UNIQUE(user_id, wish)
                )
            "#,
            )
            .execute(pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE story_nodes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL REFERENCES game_sessions(id) ON DELETE CASCADE,
                    parent_id INTEGER REFERENCES story_nodes(id),
                    user_choice TEXT,
                    story_text TEXT NOT NULL,
                    image_url TEXT NOT NULL,
                    choices TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    success_rate INTEGER,
                    is_speculative BOOLEAN NOT NULL DEFAULT FALSE,
                    speculative_depth INTEGER,
                    speculative_expires_at TIMESTAMP,
                    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                    CHECK (parent_id != id)
                )
            "#,
            )
            .execute(pool)
            .await?;

            // At most one child per (parent, choice); SQLite treats NULLs as
            // distinct, so roots get their own one-per-session index.
            sqlx::query(
                r#"
                CREATE UNIQUE INDEX idx_story_nodes_parent_choice
                ON story_nodes(session_id, parent_id, user_choice)
                WHERE parent_id IS NOT NULL
            "#,
            )
            .execute(pool)
            .await?;

            sqlx::query(
                r#"
                CREATE UNIQUE INDEX idx_story_nodes_root
                ON story_nodes(session_id)
                WHERE parent_id IS NULL
            "#,
            )
            .execute(pool)
            .await?;

            sqlx::query("CREATE INDEX idx_story_nodes_session ON story_nodes(session_id)")
                .execute(pool)
                .await?;
            sqlx::query("CREATE INDEX idx_story_nodes_parent ON story_nodes(parent_id)")
                .execute(pool)
                .await?;
        }
        2 => {
            sqlx::query(
                r#"
                CREATE TABLE story_saves (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL REFERENCES game_sessions(id) ON DELETE CASCADE,
                    node_id INTEGER NOT NULL REFERENCES story_nodes(id),
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )
            "#,
            )
            .execute(pool)
            .await?;

            sqlx::query("CREATE INDEX idx_story_saves_session ON story_saves(session_id)")
                .execute(pool)
                .await?;

            sqlx::query(
                r#"
                CREATE TABLE wish_moderation_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT,
                    wish_text TEXT NOT NULL,
                    status TEXT NOT NULL,
                    reason TEXT,
                    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )
            "#,
            )
            .execute(pool)
            .await?;
        }
        _ => {
            anyhow::bail!("Unknown migration version: {}", version);
        }
    }

    Ok(())
}
