//! At-most-once ingestion and side effects.
//!
//! `ingest` deduplicates comments on `(organization_id, external_comment_id)`.
//! `guard_once` runs a side effect (credit deduction, Shield dispatch, queue
//! job) at most once per `(comment_id, operation_key)` and memoizes its
//! successful result in the repository. Failed runs are not memoized, so a
//! retry can try again.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Error, ValidationError};
use crate::locks::KeyedLocks;
use crate::store::traits::Repository;
use crate::triage::types::{Comment, CommentPayload};

/// Result of `ingest`.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub comment: Comment,
    /// False when the comment already existed.
    pub created: bool,
}

/// Result of `guard_once`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Guarded<T> {
    pub value: T,
    /// The operation had already run; `value` is the memoized result.
    pub already_processed: bool,
}

/// Deduplicates deliveries and side effects.
pub struct IdempotencyGuard {
    repository: Arc<dyn Repository>,
    locks: KeyedLocks,
}

impl IdempotencyGuard {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            locks: KeyedLocks::new(),
        }
    }

    /// Store a comment once per `(organization_id, external_comment_id)`.
    pub async fn ingest(
        &self,
        organization_id: &str,
        external_comment_id: &str,
        payload: CommentPayload,
    ) -> Result<Ingested, Error> {
        if organization_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "organization_id".into(),
            }
            .into());
        }
        if external_comment_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "external_comment_id".into(),
            }
            .into());
        }

        let _guard = self
            .locks
            .lock(&format!("ingest:{organization_id}:{external_comment_id}"))
            .await;

        let candidate = Comment {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            external_comment_id: external_comment_id.to_string(),
            platform: payload.platform,
            text: payload.text,
            author_id: payload.author_id,
            author_username: payload.author_username,
            created_at: Utc::now(),
        };

        let (comment, created) = self.repository.insert_comment_if_absent(&candidate).await?;
        if created {
            debug!(
                organization_id,
                external_comment_id,
                comment_id = %comment.id,
                "Comment ingested"
            );
        } else if comment.text != candidate.text || comment.author_id != candidate.author_id {
            warn!(
                organization_id,
                external_comment_id,
                comment_id = %comment.id,
                "Redelivered comment differs from stored copy, keeping original"
            );
        } else {
            debug!(organization_id, external_comment_id, "Duplicate delivery ignored");
        }

        Ok(Ingested { comment, created })
    }

    /// Whether `operation_key` already ran for the comment.
    pub async fn already_ran(&self, comment_id: &str, operation_key: &str) -> Result<bool, Error> {
        Ok(self
            .repository
            .get_operation_result(comment_id, operation_key)
            .await?
            .is_some())
    }

    /// Run `operation` at most once for `(comment_id, operation_key)`.
    pub async fn guard_once<T, F, Fut>(
        &self,
        comment_id: &str,
        operation_key: &str,
        operation: F,
    ) -> Result<Guarded<T>, Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let _guard = self
            .locks
            .lock(&format!("op:{comment_id}:{operation_key}"))
            .await;

        if let Some(stored) = self
            .repository
            .get_operation_result(comment_id, operation_key)
            .await?
        {
            debug!(comment_id, operation_key, "Operation already processed");
            let value = serde_json::from_value(stored).map_err(|e| {
                DatabaseError::Serialization(format!("memoized {operation_key}: {e}"))
            })?;
            return Ok(Guarded {
                value,
                already_processed: true,
            });
        }

        let value = operation().await?;
        let encoded = serde_json::to_value(&value)
            .map_err(|e| DatabaseError::Serialization(format!("memoize {operation_key}: {e}")))?;
        if !self
            .repository
            .put_operation_result(comment_id, operation_key, &encoded)
            .await?
        {
            // Another instance won the race past our in-process lock
            warn!(comment_id, operation_key, "Operation result already stored by another writer");
        }

        Ok(Guarded {
            value,
            already_processed: false,
        })
    }
}
