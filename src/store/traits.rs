//! `Repository` trait: single async interface for triage persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::scoring::ToxicityScore;
use crate::shield::action::{ShieldAction, ShieldStatus};
use crate::triage::types::Comment;

/// One violation by one author. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub author_id: String,
    pub organization_id: String,
    pub comment_id: String,
    pub occurred_at: DateTime<Utc>,
    /// Whether this violation moved the author into a higher offender state.
    pub escalated: bool,
    /// Author's strike count after this violation.
    pub strike_count: u32,
}

/// First successful score for one comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub organization_id: String,
    pub comment_id: String,
    /// blake3 of the scored text.
    pub content_hash: String,
    pub score: ToxicityScore,
    pub fallback_used: bool,
}

/// Result of a compare-and-set violation append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrikeWrite {
    /// Violation stored and counter advanced.
    Applied,
    /// Counter moved since it was read; nothing written.
    Conflict { current: u32 },
    /// This comment already has a violation; nothing written.
    Duplicate(ViolationRecord),
}

/// Backend-agnostic persistence for comments, strikes, Shield actions and
/// memoized side effects.
#[async_trait]
pub trait Repository: Send + Sync {
    // ── Comments ────────────────────────────────────────────────────

    /// Insert unless `(organization_id, external_comment_id)` exists.
    ///
    /// Returns the stored comment and whether this call created it.
    async fn insert_comment_if_absent(
        &self,
        comment: &Comment,
    ) -> Result<(Comment, bool), DatabaseError>;

    async fn get_comment_by_external_id(
        &self,
        organization_id: &str,
        external_comment_id: &str,
    ) -> Result<Option<Comment>, DatabaseError>;

    // ── Scores ──────────────────────────────────────────────────────

    async fn get_comment_score(
        &self,
        organization_id: &str,
        comment_id: &str,
    ) -> Result<Option<ScoreRecord>, DatabaseError>;

    /// Store `record` unless the comment already has a score.
    ///
    /// Returns the stored record: the first one written wins.
    async fn put_comment_score_if_absent(
        &self,
        record: &ScoreRecord,
    ) -> Result<ScoreRecord, DatabaseError>;

    // ── Strikes and violations ──────────────────────────────────────

    /// Current strike count for an author (0 when unknown).
    async fn strike_count(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<u32, DatabaseError>;

    /// Append `record` and set the counter to `record.strike_count`, but
    /// only if the counter still equals `expected` and the comment has no
    /// violation yet. The check and both writes happen atomically, also
    /// against other processes sharing the store. Lock contention surfaces
    /// as `DatabaseError::Busy`.
    async fn append_violation(
        &self,
        record: &ViolationRecord,
        expected: u32,
    ) -> Result<StrikeWrite, DatabaseError>;

    async fn find_violation(
        &self,
        organization_id: &str,
        comment_id: &str,
    ) -> Result<Option<ViolationRecord>, DatabaseError>;

    /// Violations for an author, oldest first.
    async fn violations_for_author(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<Vec<ViolationRecord>, DatabaseError>;

    // ── Shield actions ──────────────────────────────────────────────

    /// Insert unless the comment already has an action.
    ///
    /// Returns the stored action and whether this call created it.
    async fn insert_shield_action(
        &self,
        action: &ShieldAction,
    ) -> Result<(ShieldAction, bool), DatabaseError>;

    /// Update status, enforcing the status machine. Actions of other
    /// organizations are reported as not found.
    async fn update_shield_action_status(
        &self,
        organization_id: &str,
        id: Uuid,
        status: ShieldStatus,
    ) -> Result<ShieldAction, DatabaseError>;

    async fn shield_actions_for_author(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<Vec<ShieldAction>, DatabaseError>;

    // ── Memoized operations ─────────────────────────────────────────

    async fn get_operation_result(
        &self,
        comment_id: &str,
        operation_key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Store a result unless one exists. Returns false if one already did.
    async fn put_operation_result(
        &self,
        comment_id: &str,
        operation_key: &str,
        result: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;
}
