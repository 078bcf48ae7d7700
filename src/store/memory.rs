//! In-process `Repository` for tests and single-instance deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::shield::action::{ShieldAction, ShieldStatus};
use crate::store::traits::{Repository, ScoreRecord, StrikeWrite, ViolationRecord};
use crate::triage::types::Comment;

type OrgKey = (String, String);

#[derive(Default)]
struct State {
    /// (organization_id, external_comment_id) -> comment
    comments: HashMap<OrgKey, Comment>,
    /// (organization_id, comment_id) -> first successful score
    scores: HashMap<OrgKey, ScoreRecord>,
    /// (organization_id, author_id) -> strikes
    strikes: HashMap<OrgKey, u32>,
    violations: Vec<ViolationRecord>,
    /// comment_id -> action
    shield_actions: HashMap<String, ShieldAction>,
    /// (comment_id, operation_key) -> result
    operations: HashMap<OrgKey, serde_json::Value>,
}

/// `Repository` backed by a single mutex-guarded map set.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(a: &str, b: &str) -> OrgKey {
    (a.to_string(), b.to_string())
}

#[async_trait]
impl Repository for MemoryStore {
    async fn insert_comment_if_absent(
        &self,
        comment: &Comment,
    ) -> Result<(Comment, bool), DatabaseError> {
        let mut state = self.state.lock().await;
        let k = key(&comment.organization_id, &comment.external_comment_id);
        if let Some(existing) = state.comments.get(&k) {
            return Ok((existing.clone(), false));
        }
        state.comments.insert(k, comment.clone());
        Ok((comment.clone(), true))
    }

    async fn get_comment_by_external_id(
        &self,
        organization_id: &str,
        external_comment_id: &str,
    ) -> Result<Option<Comment>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .comments
            .get(&key(organization_id, external_comment_id))
            .cloned())
    }

    async fn get_comment_score(
        &self,
        organization_id: &str,
        comment_id: &str,
    ) -> Result<Option<ScoreRecord>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state.scores.get(&key(organization_id, comment_id)).cloned())
    }

    async fn put_comment_score_if_absent(
        &self,
        record: &ScoreRecord,
    ) -> Result<ScoreRecord, DatabaseError> {
        let mut state = self.state.lock().await;
        Ok(state
            .scores
            .entry(key(&record.organization_id, &record.comment_id))
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn strike_count(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<u32, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .strikes
            .get(&key(organization_id, author_id))
            .copied()
            .unwrap_or(0))
    }

    async fn append_violation(
        &self,
        record: &ViolationRecord,
        expected: u32,
    ) -> Result<StrikeWrite, DatabaseError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.violations.iter().find(|v| {
            v.organization_id == record.organization_id && v.comment_id == record.comment_id
        }) {
            return Ok(StrikeWrite::Duplicate(existing.clone()));
        }

        let k = key(&record.organization_id, &record.author_id);
        let current = state.strikes.get(&k).copied().unwrap_or(0);
        if current != expected {
            return Ok(StrikeWrite::Conflict { current });
        }

        state.strikes.insert(k, record.strike_count);
        state.violations.push(record.clone());
        Ok(StrikeWrite::Applied)
    }

    async fn find_violation(
        &self,
        organization_id: &str,
        comment_id: &str,
    ) -> Result<Option<ViolationRecord>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .violations
            .iter()
            .find(|v| v.organization_id == organization_id && v.comment_id == comment_id)
            .cloned())
    }

    async fn violations_for_author(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<Vec<ViolationRecord>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .violations
            .iter()
            .filter(|v| v.organization_id == organization_id && v.author_id == author_id)
            .cloned()
            .collect())
    }

    async fn insert_shield_action(
        &self,
        action: &ShieldAction,
    ) -> Result<(ShieldAction, bool), DatabaseError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.shield_actions.get(&action.comment_id) {
            return Ok((existing.clone(), false));
        }
        state
            .shield_actions
            .insert(action.comment_id.clone(), action.clone());
        Ok((action.clone(), true))
    }

    async fn update_shield_action_status(
        &self,
        organization_id: &str,
        id: Uuid,
        status: ShieldStatus,
    ) -> Result<ShieldAction, DatabaseError> {
        let mut state = self.state.lock().await;
        let action = state
            .shield_actions
            .values_mut()
            .find(|a| a.id == id && a.organization_id == organization_id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "shield_action".into(),
                id: id.to_string(),
            })?;
        action.transition_to(status).map_err(DatabaseError::Constraint)?;
        Ok(action.clone())
    }

    async fn shield_actions_for_author(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<Vec<ShieldAction>, DatabaseError> {
        let state = self.state.lock().await;
        let mut actions: Vec<ShieldAction> = state
            .shield_actions
            .values()
            .filter(|a| a.organization_id == organization_id && a.author_id == author_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.created_at);
        Ok(actions)
    }

    async fn get_operation_result(
        &self,
        comment_id: &str,
        operation_key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .operations
            .get(&key(comment_id, operation_key))
            .cloned())
    }

    async fn put_operation_result(
        &self,
        comment_id: &str,
        operation_key: &str,
        result: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.lock().await;
        let k = key(comment_id, operation_key);
        if state.operations.contains_key(&k) {
            return Ok(false);
        }
        state.operations.insert(k, result.clone());
        Ok(true)
    }
}
