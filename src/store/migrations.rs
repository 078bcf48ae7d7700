//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS comments (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                external_comment_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                text TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_username TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (organization_id, external_comment_id)
            );
            CREATE INDEX IF NOT EXISTS idx_comments_author
                ON comments(organization_id, author_id);

            CREATE TABLE IF NOT EXISTS author_strikes (
                organization_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                strike_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (organization_id, author_id)
            );

            CREATE TABLE IF NOT EXISTS violations (
                organization_id TEXT NOT NULL,
                comment_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                escalated INTEGER NOT NULL DEFAULT 0,
                strike_count INTEGER NOT NULL,
                PRIMARY KEY (organization_id, comment_id)
            );
            CREATE INDEX IF NOT EXISTS idx_violations_author
                ON violations(organization_id, author_id);
        "#,
    },
    Migration {
        version: 2,
        name: "shield_actions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS shield_actions (
                id TEXT PRIMARY KEY,
                comment_id TEXT NOT NULL UNIQUE,
                organization_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                priority INTEGER NOT NULL,
                reason TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                dry_run INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_shield_actions_author
                ON shield_actions(organization_id, author_id);
            CREATE INDEX IF NOT EXISTS idx_shield_actions_status
                ON shield_actions(status);
        "#,
    },
    Migration {
        version: 3,
        name: "operation_results",
        sql: r#"
            CREATE TABLE IF NOT EXISTS operation_results (
                comment_id TEXT NOT NULL,
                operation_key TEXT NOT NULL,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (comment_id, operation_key)
            );
        "#,
    },
    Migration {
        version: 4,
        name: "comment_scores",
        sql: r#"
            CREATE TABLE IF NOT EXISTS comment_scores (
                organization_id TEXT NOT NULL,
                comment_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                score TEXT NOT NULL,
                fallback_used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (organization_id, comment_id)
            );
        "#,
    },
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "comments",
            "author_strikes",
            "violations",
            "shield_actions",
            "operation_results",
            "comment_scores",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 4);
    }
}
