use chrono::Utc;
use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};

// Embed all migration SQL files at compile time
const MIGRATION_SYNC_RECORDS: &str =
    include_str!("../migrations/20250612000000_sync_records.sql");
const MIGRATION_SYNC_QUEUE: &str = include_str!("../migrations/20250612000001_sync_queue.sql");
const MIGRATION_ENTITIES: &str = include_str!("../migrations/20250612000002_entities.sql");

const MIGRATIONS: &[(&str, &str)] = &[
    ("20250612000000_sync_records.sql", MIGRATION_SYNC_RECORDS),
    ("20250612000001_sync_queue.sql", MIGRATION_SYNC_QUEUE),
    ("20250612000002_entities.sql", MIGRATION_ENTITIES),
];

/// Bring the given database up to the current schema. Safe to call on every
/// startup; applied migrations are tracked in a `migrations` table and
/// skipped on later runs.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    create_migrations_table(pool).await?;
    let last_migration = get_last_migration(pool).await?;
    apply_pending_migrations(pool, last_migration).await
}

async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Migration(format!("Failed to create migrations table: {}", e)))?;
    Ok(())
}

async fn get_last_migration(pool: &SqlitePool) -> DbResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT name FROM migrations ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|e| DbError::Migration(format!("Failed to read migration history: {}", e)))
}

async fn apply_pending_migrations(
    pool: &SqlitePool,
    last_migration: Option<String>,
) -> DbResult<()> {
    // Migration names sort lexicographically by timestamp prefix, so anything
    // after the last applied name is pending.
    let pending: Vec<&(&str, &str)> = MIGRATIONS
        .iter()
        .filter(|(name, _)| match &last_migration {
            Some(last) => *name > last.as_str(),
            None => true,
        })
        .collect();

    if pending.is_empty() {
        log::debug!("database schema is up to date");
        return Ok(());
    }

    log::info!("applying {} pending migration(s)", pending.len());

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DbError::Migration(format!("Failed to begin transaction: {}", e)))?;

    for (name, sql) in pending {
        log::info!("applying migration {}", name);
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Migration {} failed: {}", name, e)))?;

        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                DbError::Migration(format!("Failed to record migration {}: {}", name, e))
            })?;
    }

    tx.commit()
        .await
        .map_err(|e| DbError::Migration(format!("Failed to commit migrations: {}", e)))?;

    log::info!("database migrations complete");
    Ok(())
}
