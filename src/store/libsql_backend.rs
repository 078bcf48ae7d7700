//! libSQL backend: async `Repository` implementation.
//!
//! Supports local file and in-memory databases. The violation append runs
//! in one `BEGIN IMMEDIATE` transaction: the duplicate check, the strike
//! compare-and-set and the insert are atomic even when other processes
//! write to the same file. Lock contention is reported as
//! `DatabaseError::Busy` for the caller to retry.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::shield::action::{ShieldAction, ShieldActionType, ShieldStatus};
use crate::store::migrations;
use crate::store::traits::{Repository, ScoreRecord, StrikeWrite, ViolationRecord};
use crate::triage::types::Comment;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT: i32 = 19;

/// Primary result code of a SQLite failure.
fn sqlite_code(e: &libsql::Error) -> Option<i32> {
    match e {
        libsql::Error::SqliteFailure(code, _) => Some(code & 0xff),
        _ => None,
    }
}

/// Classify a libSQL error: lock contention is retryable.
fn db_error(op: &str, e: libsql::Error) -> DatabaseError {
    match sqlite_code(&e) {
        Some(SQLITE_BUSY | SQLITE_LOCKED) => DatabaseError::Busy(format!("{op}: {e}")),
        Some(SQLITE_CONSTRAINT) => DatabaseError::Constraint(format!("{op}: {e}")),
        _ if e.to_string().contains("database is locked") => {
            DatabaseError::Busy(format!("{op}: {e}"))
        }
        _ => DatabaseError::Query(format!("{op}: {e}")),
    }
}

const COMMENT_COLUMNS: &str = "id, organization_id, external_comment_id, platform, text, \
     author_id, author_username, created_at";

fn row_to_comment(row: &libsql::Row) -> Result<Comment, libsql::Error> {
    let created_str: String = row.get(7)?;
    Ok(Comment {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        external_comment_id: row.get(2)?,
        platform: row.get(3)?,
        text: row.get(4)?,
        author_id: row.get(5)?,
        author_username: row.get(6).ok(),
        created_at: parse_datetime(&created_str),
    })
}

const VIOLATION_COLUMNS: &str =
    "organization_id, comment_id, author_id, occurred_at, escalated, strike_count";

fn row_to_violation(row: &libsql::Row) -> Result<ViolationRecord, libsql::Error> {
    let occurred_str: String = row.get(3)?;
    let escalated: i64 = row.get(4)?;
    let strike_count: i64 = row.get(5)?;
    Ok(ViolationRecord {
        organization_id: row.get(0)?,
        comment_id: row.get(1)?,
        author_id: row.get(2)?,
        occurred_at: parse_datetime(&occurred_str),
        escalated: escalated != 0,
        strike_count: strike_count.max(0) as u32,
    })
}

const SHIELD_COLUMNS: &str = "id, comment_id, organization_id, author_id, action_type, \
     priority, reason, status, dry_run, created_at";

fn row_to_shield_action(row: &libsql::Row) -> Result<ShieldAction, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("shield row parse: {e}"));
    let id_str: String = row.get(0).map_err(parse)?;
    let type_str: String = row.get(4).map_err(parse)?;
    let priority: i64 = row.get(5).map_err(parse)?;
    let status_str: String = row.get(7).map_err(parse)?;
    let dry_run: i64 = row.get(8).map_err(parse)?;
    let created_str: String = row.get(9).map_err(parse)?;

    Ok(ShieldAction {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("shield id: {e}")))?,
        comment_id: row.get(1).map_err(parse)?,
        organization_id: row.get(2).map_err(parse)?,
        author_id: row.get(3).map_err(parse)?,
        action_type: ShieldActionType::parse(&type_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown action_type '{type_str}'"))
        })?,
        priority: priority.clamp(0, u8::MAX as i64) as u8,
        reason: row.get(6).map_err(parse)?,
        status: ShieldStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown status '{status_str}'"))
        })?,
        dry_run: dry_run != 0,
        created_at: parse_datetime(&created_str),
    })
}

async fn query_strike_count(
    conn: &Connection,
    organization_id: &str,
    author_id: &str,
) -> Result<u32, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT strike_count FROM author_strikes
             WHERE organization_id = ?1 AND author_id = ?2",
            params![organization_id, author_id],
        )
        .await
        .map_err(|e| db_error("strike_count", e))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let count: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            Ok(count.max(0) as u32)
        }
        Ok(None) => Ok(0),
        Err(e) => Err(db_error("strike_count", e)),
    }
}

async fn query_violation(
    conn: &Connection,
    organization_id: &str,
    comment_id: &str,
) -> Result<Option<ViolationRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {VIOLATION_COLUMNS} FROM violations
                 WHERE organization_id = ?1 AND comment_id = ?2"
            ),
            params![organization_id, comment_id],
        )
        .await
        .map_err(|e| db_error("find_violation", e))?;

    match rows.next().await {
        Ok(Some(row)) => row_to_violation(&row)
            .map(Some)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
        Ok(None) => Ok(None),
        Err(e) => Err(db_error("find_violation", e)),
    }
}

async fn query_score(
    conn: &Connection,
    organization_id: &str,
    comment_id: &str,
) -> Result<Option<ScoreRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT content_hash, score, fallback_used FROM comment_scores
             WHERE organization_id = ?1 AND comment_id = ?2",
            params![organization_id, comment_id],
        )
        .await
        .map_err(|e| db_error("get_comment_score", e))?;

    let row = match rows.next().await {
        Ok(Some(row)) => row,
        Ok(None) => return Ok(None),
        Err(e) => return Err(db_error("get_comment_score", e)),
    };
    let parse = |e: libsql::Error| DatabaseError::Query(format!("score row parse: {e}"));
    let raw: String = row.get(1).map_err(parse)?;
    let fallback_used: i64 = row.get(2).map_err(parse)?;
    Ok(Some(ScoreRecord {
        organization_id: organization_id.to_string(),
        comment_id: comment_id.to_string(),
        content_hash: row.get(0).map_err(parse)?,
        score: serde_json::from_str(&raw)
            .map_err(|e| DatabaseError::Serialization(format!("comment score: {e}")))?,
        fallback_used: fallback_used != 0,
    }))
}

impl LibSqlBackend {
    async fn query_comment(
        &self,
        organization_id: &str,
        external_comment_id: &str,
    ) -> Result<Option<Comment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM comments
                     WHERE organization_id = ?1 AND external_comment_id = ?2"
                ),
                params![organization_id, external_comment_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_comment_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_comment(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_comment_by_external_id: {e}"))),
        }
    }

    async fn query_shield_action_by_comment(
        &self,
        comment_id: &str,
    ) -> Result<Option<ShieldAction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SHIELD_COLUMNS} FROM shield_actions WHERE comment_id = ?1"),
                params![comment_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_shield_action: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_shield_action(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_shield_action: {e}"))),
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Repository for LibSqlBackend {
    // ── Comments ────────────────────────────────────────────────────

    async fn insert_comment_if_absent(
        &self,
        comment: &Comment,
    ) -> Result<(Comment, bool), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO comments (id, organization_id, external_comment_id, platform, text,
                    author_id, author_username, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (organization_id, external_comment_id) DO NOTHING",
                params![
                    comment.id.clone(),
                    comment.organization_id.clone(),
                    comment.external_comment_id.clone(),
                    comment.platform.clone(),
                    comment.text.clone(),
                    comment.author_id.clone(),
                    opt_text(comment.author_username.as_deref()),
                    comment.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_comment: {e}")))?;

        if inserted > 0 {
            debug!(id = %comment.id, external_id = %comment.external_comment_id, "Comment inserted");
            return Ok((comment.clone(), true));
        }

        let existing = self
            .query_comment(&comment.organization_id, &comment.external_comment_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "comment".into(),
                id: comment.external_comment_id.clone(),
            })?;
        Ok((existing, false))
    }

    async fn get_comment_by_external_id(
        &self,
        organization_id: &str,
        external_comment_id: &str,
    ) -> Result<Option<Comment>, DatabaseError> {
        self.query_comment(organization_id, external_comment_id).await
    }

    // ── Scores ──────────────────────────────────────────────────────

    async fn get_comment_score(
        &self,
        organization_id: &str,
        comment_id: &str,
    ) -> Result<Option<ScoreRecord>, DatabaseError> {
        query_score(self.conn(), organization_id, comment_id).await
    }

    async fn put_comment_score_if_absent(
        &self,
        record: &ScoreRecord,
    ) -> Result<ScoreRecord, DatabaseError> {
        let raw = serde_json::to_string(&record.score)
            .map_err(|e| DatabaseError::Serialization(format!("comment score: {e}")))?;
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO comment_scores (organization_id, comment_id, content_hash, score,
                    fallback_used)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (organization_id, comment_id) DO NOTHING",
                params![
                    record.organization_id.clone(),
                    record.comment_id.clone(),
                    record.content_hash.clone(),
                    raw,
                    record.fallback_used as i64,
                ],
            )
            .await
            .map_err(|e| db_error("put_comment_score", e))?;

        if inserted > 0 {
            return Ok(record.clone());
        }
        query_score(self.conn(), &record.organization_id, &record.comment_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "comment_score".into(),
                id: record.comment_id.clone(),
            })
    }

    // ── Strikes and violations ──────────────────────────────────────

    async fn strike_count(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<u32, DatabaseError> {
        query_strike_count(self.conn(), organization_id, author_id).await
    }

    async fn append_violation(
        &self,
        record: &ViolationRecord,
        expected: u32,
    ) -> Result<StrikeWrite, DatabaseError> {
        let _guard = self.write_lock.lock().await;

        // IMMEDIATE takes the write lock up front, so no other connection can
        // move the counter between the checks and the writes below.
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| db_error("append_violation begin", e))?;

        if let Some(existing) =
            query_violation(&tx, &record.organization_id, &record.comment_id).await?
        {
            tx.rollback().await.ok();
            return Ok(StrikeWrite::Duplicate(existing));
        }

        let now = Utc::now().to_rfc3339();
        let moved = if expected == 0 {
            tx.execute(
                "INSERT INTO author_strikes (organization_id, author_id, strike_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (organization_id, author_id)
                 DO UPDATE SET strike_count = excluded.strike_count,
                     updated_at = excluded.updated_at
                 WHERE author_strikes.strike_count = 0",
                params![
                    record.organization_id.clone(),
                    record.author_id.clone(),
                    record.strike_count as i64,
                    now,
                ],
            )
            .await
        } else {
            tx.execute(
                "UPDATE author_strikes SET strike_count = ?3, updated_at = ?4
                 WHERE organization_id = ?1 AND author_id = ?2 AND strike_count = ?5",
                params![
                    record.organization_id.clone(),
                    record.author_id.clone(),
                    record.strike_count as i64,
                    now,
                    expected as i64,
                ],
            )
            .await
        };
        let moved = moved.map_err(|e| db_error("append_violation strikes", e))?;

        if moved == 0 {
            let current =
                query_strike_count(&tx, &record.organization_id, &record.author_id).await?;
            tx.rollback().await.ok();
            return Ok(StrikeWrite::Conflict { current });
        }

        let inserted = tx
            .execute(
                "INSERT INTO violations (organization_id, comment_id, author_id, occurred_at,
                    escalated, strike_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.organization_id.clone(),
                    record.comment_id.clone(),
                    record.author_id.clone(),
                    record.occurred_at.to_rfc3339(),
                    record.escalated as i64,
                    record.strike_count as i64,
                ],
            )
            .await;
        if let Err(e) = inserted {
            tx.rollback().await.ok();
            return match db_error("append_violation", e) {
                DatabaseError::Constraint(_) => {
                    match query_violation(self.conn(), &record.organization_id, &record.comment_id)
                        .await?
                    {
                        Some(existing) => Ok(StrikeWrite::Duplicate(existing)),
                        None => Err(DatabaseError::Constraint(format!(
                            "append_violation: violation for {} rejected",
                            record.comment_id
                        ))),
                    }
                }
                other => Err(other),
            };
        }

        if let Err(e) = tx.commit().await {
            // A failed COMMIT can leave the transaction open on this connection
            self.conn().execute("ROLLBACK", ()).await.ok();
            return Err(db_error("append_violation commit", e));
        }

        debug!(
            organization_id = %record.organization_id,
            author_id = %record.author_id,
            strike_count = record.strike_count,
            "Violation recorded"
        );
        Ok(StrikeWrite::Applied)
    }

    async fn find_violation(
        &self,
        organization_id: &str,
        comment_id: &str,
    ) -> Result<Option<ViolationRecord>, DatabaseError> {
        query_violation(self.conn(), organization_id, comment_id).await
    }

    async fn violations_for_author(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<Vec<ViolationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {VIOLATION_COLUMNS} FROM violations
                     WHERE organization_id = ?1 AND author_id = ?2
                     ORDER BY strike_count ASC"
                ),
                params![organization_id, author_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("violations_for_author: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_violation(&row) {
                Ok(v) => records.push(v),
                Err(e) => tracing::warn!("Skipping violation row: {e}"),
            }
        }
        Ok(records)
    }

    // ── Shield actions ──────────────────────────────────────────────

    async fn insert_shield_action(
        &self,
        action: &ShieldAction,
    ) -> Result<(ShieldAction, bool), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO shield_actions (id, comment_id, organization_id, author_id,
                    action_type, priority, reason, status, dry_run, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (comment_id) DO NOTHING",
                params![
                    action.id.to_string(),
                    action.comment_id.clone(),
                    action.organization_id.clone(),
                    action.author_id.clone(),
                    action.action_type.as_str(),
                    action.priority as i64,
                    action.reason.clone(),
                    action.status.as_str(),
                    action.dry_run as i64,
                    action.created_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_shield_action: {e}")))?;

        if inserted > 0 {
            return Ok((action.clone(), true));
        }
        let existing = self
            .query_shield_action_by_comment(&action.comment_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "shield_action".into(),
                id: action.comment_id.clone(),
            })?;
        Ok((existing, false))
    }

    async fn update_shield_action_status(
        &self,
        organization_id: &str,
        id: Uuid,
        status: ShieldStatus,
    ) -> Result<ShieldAction, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SHIELD_COLUMNS} FROM shield_actions
                     WHERE id = ?1 AND organization_id = ?2"
                ),
                params![id.to_string(), organization_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_shield_action_status: {e}")))?;

        let mut action = match rows.next().await {
            Ok(Some(row)) => row_to_shield_action(&row)?,
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "shield_action".into(),
                    id: id.to_string(),
                });
            }
            Err(e) => {
                return Err(DatabaseError::Query(format!(
                    "update_shield_action_status: {e}"
                )));
            }
        };
        action.transition_to(status).map_err(DatabaseError::Constraint)?;

        self.conn()
            .execute(
                "UPDATE shield_actions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| db_error("update_shield_action_status", e))?;
        Ok(action)
    }

    async fn shield_actions_for_author(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<Vec<ShieldAction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SHIELD_COLUMNS} FROM shield_actions
                     WHERE organization_id = ?1 AND author_id = ?2
                     ORDER BY created_at ASC"
                ),
                params![organization_id, author_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("shield_actions_for_author: {e}")))?;

        let mut actions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_shield_action(&row) {
                Ok(a) => actions.push(a),
                Err(e) => tracing::warn!("Skipping shield action row: {e}"),
            }
        }
        Ok(actions)
    }

    // ── Memoized operations ─────────────────────────────────────────

    async fn get_operation_result(
        &self,
        comment_id: &str,
        operation_key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT result FROM operation_results
                 WHERE comment_id = ?1 AND operation_key = ?2",
                params![comment_id, operation_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_operation_result: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| DatabaseError::Serialization(format!("operation result: {e}")))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_operation_result: {e}"))),
        }
    }

    async fn put_operation_result(
        &self,
        comment_id: &str,
        operation_key: &str,
        result: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let raw = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(format!("operation result: {e}")))?;
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO operation_results (comment_id, operation_key, result)
                 VALUES (?1, ?2, ?3)",
                params![comment_id, operation_key, raw],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_operation_result: {e}")))?;
        Ok(inserted > 0)
    }
}
