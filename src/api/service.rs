//! Boundary service consumed by the HTTP routes.
//!
//! Every response and every error carries a `correlation_id`. Errors are
//! reported as `ServiceError`, which keeps the id next to the cause so the
//! route layer can render both.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::CacheStats;
use crate::error::{Error, Outcome, ValidationError};
use crate::pipeline::{CommentProcessor, InboundComment, ProcessedComment};
use crate::shield::action::{ShieldAction, ShieldStatus};
use crate::stats::{DecisionStats, TimeRange};
use crate::triage::TriageEngine;
use crate::triage::types::{AnalyzeOptions, Comment, Decision, Organization, UserContext};

/// Largest accepted batch.
pub const MAX_BATCH_SIZE: usize = 50;

/// Caller identity resolved by the upstream gateway.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub organization: Organization,
    pub user: UserContext,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn new(organization: Organization, user: UserContext) -> Self {
        Self {
            organization,
            user,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

// ── Requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    /// Stable id for repeated analysis of the same comment. The first
    /// successful score is kept for it; different content under the same id
    /// is rejected with `CONTENT_MISMATCH`.
    #[serde(default)]
    pub comment_id: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_username: Option<String>,
    /// Client tags copied into the decision metadata.
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub user_preferences: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub time_range: Option<String>,
    #[serde(default)]
    pub include_cache: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Deadline for each item, in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub comments: Vec<AnalyzeRequest>,
    #[serde(default)]
    pub options: Option<BatchOptions>,
}

// ── Responses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub correlation_id: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub correlation_id: String,
    pub organization_id: String,
    #[serde(flatten)]
    pub stats: DecisionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_performance: Option<CacheStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemError {
    pub index: usize,
    #[serde(flatten)]
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total_comments: usize,
    pub successful_analyses: usize,
    pub failed_analyses: usize,
    pub decision_counts: BTreeMap<String, u64>,
    pub average_toxicity: Option<f64>,
    pub shield_actions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub correlation_id: String,
    pub results: Vec<BatchItemResult>,
    pub errors: Vec<BatchItemError>,
    pub summary: BatchSummary,
}

/// Outcome reported by a platform worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ShieldStatusRequest {
    pub status: ShieldStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShieldStatusResponse {
    pub correlation_id: String,
    pub action: ShieldAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearCacheResponse {
    pub correlation_id: String,
    pub cleared_entries: u64,
    pub cleared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub correlation_id: String,
    #[serde(flatten)]
    pub processed: ProcessedComment,
}

/// Wire shape of an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Seconds until a retry may succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        let field = match error {
            Error::Validation(e) => Some(e.field().to_string()),
            _ => None,
        };
        let retry_after = match error.outcome() {
            Outcome::RetryLater { retry_after } => retry_after.map(|d| d.as_secs().max(1)),
            _ => None,
        };
        // Internal details stay in the logs
        let message = match error.outcome() {
            Outcome::Internal => "Analysis failed".to_string(),
            _ => error.to_string(),
        };
        Self {
            code: error.code().to_string(),
            message,
            field,
            retry_after,
        }
    }
}

/// An error tagged with the request's correlation id.
#[derive(Debug, thiserror::Error)]
#[error("{error} (correlation_id={correlation_id})")]
pub struct ServiceError {
    pub correlation_id: String,
    pub error: Error,
}

impl ServiceError {
    pub fn new(correlation_id: &str, error: impl Into<Error>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            error: error.into(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::from(&self.error)
    }
}

// ── Service ─────────────────────────────────────────────────────────

pub struct TriageService {
    engine: Arc<TriageEngine>,
    processor: Arc<CommentProcessor>,
}

impl TriageService {
    pub fn new(engine: Arc<TriageEngine>, processor: Arc<CommentProcessor>) -> Self {
        Self { engine, processor }
    }

    pub fn engine(&self) -> &TriageEngine {
        &self.engine
    }

    /// Analyze a single comment.
    pub async fn analyze(
        &self,
        ctx: &RequestContext,
        request: AnalyzeRequest,
    ) -> Result<AnalyzeResponse, ServiceError> {
        let decision = self
            .analyze_one(ctx, request, ctx.correlation_id.clone(), None)
            .await
            .map_err(|e| self.failed(ctx, "analyze", e))?;
        Ok(AnalyzeResponse {
            correlation_id: ctx.correlation_id.clone(),
            decision,
        })
    }

    /// Decision statistics for the caller's organization.
    pub async fn stats(
        &self,
        ctx: &RequestContext,
        query: StatsQuery,
    ) -> Result<StatsResponse, ServiceError> {
        let range = match query.time_range.as_deref() {
            Some(raw) => raw
                .parse::<TimeRange>()
                .map_err(|e| self.failed(ctx, "stats", e.into()))?,
            None => TimeRange::default(),
        };
        let stats = self
            .engine
            .log()
            .summary(&ctx.organization.id, range)
            .await;
        let cache_performance = query
            .include_cache
            .unwrap_or(false)
            .then(|| self.engine.cache().stats());

        Ok(StatsResponse {
            correlation_id: ctx.correlation_id.clone(),
            organization_id: ctx.organization.id.clone(),
            stats,
            cache_performance,
        })
    }

    /// Analyze up to `MAX_BATCH_SIZE` comments concurrently.
    pub async fn batch(
        &self,
        ctx: &RequestContext,
        request: BatchRequest,
    ) -> Result<BatchResponse, ServiceError> {
        let size = request.comments.len();
        if size == 0 {
            return Err(self.failed(ctx, "batch", ValidationError::EmptyBatch.into()));
        }
        if size > MAX_BATCH_SIZE {
            return Err(self.failed(
                ctx,
                "batch",
                ValidationError::BatchTooLarge {
                    size,
                    max: MAX_BATCH_SIZE,
                }
                .into(),
            ));
        }

        let deadline = request
            .options
            .and_then(|o| o.deadline_ms)
            .map(Duration::from_millis);
        let outcomes = join_all(request.comments.into_iter().enumerate().map(|(index, item)| {
            let correlation_id = format!("{}:{index}", ctx.correlation_id);
            async move { (index, self.analyze_one(ctx, item, correlation_id, deadline).await) }
        }))
        .await;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(decision) => results.push(BatchItemResult { index, decision }),
                Err(e) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        index,
                        code = e.code(),
                        error = %e,
                        "Batch item failed"
                    );
                    errors.push(BatchItemError {
                        index,
                        error: ErrorBody::from(&e),
                    });
                }
            }
        }

        let summary = summarize(size, &results, errors.len());
        info!(
            correlation_id = %ctx.correlation_id,
            organization_id = %ctx.organization.id,
            total = summary.total_comments,
            successful = summary.successful_analyses,
            failed = summary.failed_analyses,
            "Batch analysis completed"
        );

        Ok(BatchResponse {
            correlation_id: ctx.correlation_id.clone(),
            results,
            errors,
            summary,
        })
    }

    /// Drop every cached decision. Admin only.
    pub async fn clear_cache(&self, ctx: &RequestContext) -> Result<ClearCacheResponse, ServiceError> {
        if !ctx.user.is_admin() {
            return Err(self.failed(
                ctx,
                "cache_clear",
                Error::Forbidden {
                    capability: "cache:clear".into(),
                },
            ));
        }

        let cleared_entries = self.engine.cache().stats().size;
        self.engine.cache().clear();
        info!(
            correlation_id = %ctx.correlation_id,
            user_id = %ctx.user.id,
            cleared_entries,
            "Decision cache cleared"
        );

        Ok(ClearCacheResponse {
            correlation_id: ctx.correlation_id.clone(),
            cleared_entries,
            cleared_at: Utc::now(),
        })
    }

    /// Record a worker's outcome for a Shield action. Admin only.
    pub async fn report_shield_status(
        &self,
        ctx: &RequestContext,
        action_id: Uuid,
        request: ShieldStatusRequest,
    ) -> Result<ShieldStatusResponse, ServiceError> {
        if !ctx.user.is_admin() {
            return Err(self.failed(
                ctx,
                "shield_status",
                Error::Forbidden {
                    capability: "shield:update".into(),
                },
            ));
        }

        let action = self
            .processor
            .record_shield_status(&ctx.organization.id, action_id, request.status)
            .await
            .map_err(|e| self.failed(ctx, "shield_status", e))?;
        Ok(ShieldStatusResponse {
            correlation_id: ctx.correlation_id.clone(),
            action,
        })
    }

    /// Ingest a platform delivery through the pipeline.
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        inbound: InboundComment,
    ) -> Result<IngestResponse, ServiceError> {
        let options = AnalyzeOptions {
            correlation_id: Some(ctx.correlation_id.clone()),
            ..Default::default()
        };
        let processed = self
            .processor
            .process(&ctx.organization, &ctx.user, inbound, options)
            .await
            .map_err(|e| self.failed(ctx, "ingest", e))?;
        Ok(IngestResponse {
            correlation_id: ctx.correlation_id.clone(),
            processed,
        })
    }

    async fn analyze_one(
        &self,
        ctx: &RequestContext,
        request: AnalyzeRequest,
        correlation_id: String,
        deadline: Option<Duration>,
    ) -> Result<Decision, Error> {
        let comment_id = request
            .comment_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("api-{}", Uuid::new_v4()));
        let author_id = request
            .author_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("anonymous:{comment_id}"));

        let comment = Comment {
            id: comment_id.clone(),
            organization_id: ctx.organization.id.clone(),
            external_comment_id: comment_id,
            platform: request.platform.unwrap_or_else(|| "api".to_string()),
            text: request.content.unwrap_or_default(),
            author_id,
            author_username: request.author_username,
            created_at: Utc::now(),
        };

        let mut user = ctx.user.clone();
        if let Some(preferences) = request.user_preferences {
            user.preferences = preferences;
        }

        let options = AnalyzeOptions {
            correlation_id: Some(correlation_id),
            deadline,
        };
        let mut decision = self
            .engine
            .analyze(&comment, &ctx.organization, &user, options)
            .await?;

        for (key, value) in request.metadata.unwrap_or_default() {
            if !decision.metadata.insert(format!("client.{key}"), value) {
                break;
            }
        }
        Ok(decision)
    }

    fn failed(&self, ctx: &RequestContext, operation: &str, error: Error) -> ServiceError {
        match error.outcome() {
            Outcome::Internal => tracing::error!(
                correlation_id = %ctx.correlation_id,
                organization_id = %ctx.organization.id,
                operation,
                error = %error,
                "Request failed"
            ),
            _ => warn!(
                correlation_id = %ctx.correlation_id,
                organization_id = %ctx.organization.id,
                operation,
                code = error.code(),
                "Request rejected"
            ),
        }
        ServiceError::new(&ctx.correlation_id, error)
    }
}

fn summarize(total: usize, results: &[BatchItemResult], failed: usize) -> BatchSummary {
    let mut decision_counts = BTreeMap::new();
    let mut toxicity_sum = 0.0;
    let mut toxicity_n = 0usize;
    let mut shield_actions = 0;

    for result in results {
        *decision_counts
            .entry(result.decision.action.label().to_string())
            .or_insert(0u64) += 1;
        if let Some(score) = result.decision.toxicity_score {
            toxicity_sum += score;
            toxicity_n += 1;
        }
        if result.decision.shield_decision.is_some() {
            shield_actions += 1;
        }
    }

    BatchSummary {
        total_comments: total,
        successful_analyses: results.len(),
        failed_analyses: failed,
        decision_counts,
        average_toxicity: (toxicity_n > 0)
            .then(|| (toxicity_sum / toxicity_n as f64 * 1000.0).round() / 1000.0),
        shield_actions,
    }
}
