//! Comment processor: ingestion through guarded side effects.
//!
//! Flow:
//! 1. `IdempotencyGuard::ingest` deduplicates the delivery
//! 2. the plan quota is checked for comments not charged yet; a spent or
//!    unreadable quota yields a skip decision without scoring
//! 3. `TriageEngine::analyze` produces the decision
//! 4. Side effects run through `guard_once`, so a redelivered comment never
//!    charges credits, persists a Shield action or enqueues a job twice
//!
//! Skip and error decisions have no side effects and are not charged.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Error, ValidationError};
use crate::idempotency::{Guarded, IdempotencyGuard};
use crate::pipeline::credits::{CreditLedger, CreditReceipt};
use crate::pipeline::queue::{Job, JobQueue};
use crate::shield::action::{ShieldAction, ShieldStatus};
use crate::store::traits::Repository;
use crate::triage::TriageEngine;
use crate::triage::types::{
    AnalyzeOptions, Comment, CommentPayload, Decision, DecisionAction, Organization, UserContext,
};

pub const OP_CREDIT_DEDUCTION: &str = "credit_deduction";
pub const OP_SHIELD_DISPATCH: &str = "shield_dispatch";
pub const OP_FOLLOW_UP: &str = "queue:follow_up";

/// Credits charged per analyzed comment.
const ANALYSIS_COST: u32 = 1;

pub const REASON_PLAN_LIMIT: &str = "plan_limit_exceeded";
pub const REASON_QUOTA_CHECK_FAILED: &str = "permission_check_failed";

/// A platform delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundComment {
    pub external_comment_id: String,
    #[serde(flatten)]
    pub payload: CommentPayload,
}

/// Outcome of processing one delivery.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedComment {
    pub comment: Comment,
    /// False on redelivery.
    pub created: bool,
    pub decision: Decision,
    pub credit: Option<Guarded<CreditReceipt>>,
    pub shield: Option<Guarded<ShieldAction>>,
    pub follow_up: Option<Guarded<Job>>,
}

pub struct CommentProcessor {
    engine: Arc<TriageEngine>,
    guard: IdempotencyGuard,
    repository: Arc<dyn Repository>,
    ledger: Arc<dyn CreditLedger>,
    queue: Arc<JobQueue>,
}

impl CommentProcessor {
    pub fn new(
        engine: Arc<TriageEngine>,
        repository: Arc<dyn Repository>,
        ledger: Arc<dyn CreditLedger>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            engine,
            guard: IdempotencyGuard::new(repository.clone()),
            repository,
            ledger,
            queue,
        }
    }

    /// Process one delivery end to end.
    pub async fn process(
        &self,
        organization: &Organization,
        user: &UserContext,
        inbound: InboundComment,
        options: AnalyzeOptions,
    ) -> Result<ProcessedComment, Error> {
        let ingested = self
            .guard
            .ingest(&organization.id, &inbound.external_comment_id, inbound.payload)
            .await?;
        let comment = ingested.comment;

        let charged = self.guard.already_ran(&comment.id, OP_CREDIT_DEDUCTION).await?;
        let denied = if charged {
            None
        } else {
            self.quota_denial(organization, &comment.id).await
        };

        let decision = match denied {
            Some(reason) => {
                self.engine
                    .skip(&comment, organization, user, options, reason)
                    .await
            }
            None => {
                self.engine
                    .analyze(&comment, organization, user, options)
                    .await?
            }
        };

        let mut processed = ProcessedComment {
            comment,
            created: ingested.created,
            decision,
            credit: None,
            shield: None,
            follow_up: None,
        };
        if !processed.decision.action.is_final() {
            return Ok(processed);
        }

        let comment_id = processed.comment.id.clone();
        processed.credit = Some(
            self.guard
                .guard_once(&comment_id, OP_CREDIT_DEDUCTION, || {
                    self.ledger
                        .deduct(&organization.id, &comment_id, ANALYSIS_COST)
                })
                .await?,
        );

        if let Some(action) = processed.decision.shield_decision.clone() {
            processed.shield = Some(
                self.guard
                    .guard_once(&comment_id, OP_SHIELD_DISPATCH, || self.dispatch_shield(action))
                    .await?,
            );
        }

        if let Some(job) = follow_up_job(&processed.decision) {
            let queue = &self.queue;
            processed.follow_up = Some(
                self.guard
                    .guard_once(&comment_id, OP_FOLLOW_UP, || async move {
                        queue.enqueue(job.clone()).await?;
                        Ok::<_, Error>(job)
                    })
                    .await?,
            );
        }

        info!(
            correlation_id = %processed.decision.correlation_id,
            organization_id = %organization.id,
            comment_id = %comment_id,
            created = processed.created,
            action = %processed.decision.action,
            "Comment processed"
        );
        Ok(processed)
    }

    /// Process deliveries concurrently. One failure never aborts the rest.
    pub async fn process_batch(
        &self,
        organization: &Organization,
        user: &UserContext,
        inbound: Vec<InboundComment>,
    ) -> Vec<Result<ProcessedComment, Error>> {
        let count = inbound.len();
        info!(count, organization_id = %organization.id, "Processing comment batch");

        let results = join_all(
            inbound
                .into_iter()
                .map(|item| self.process(organization, user, item, AnalyzeOptions::default())),
        )
        .await;

        for (index, result) in results.iter().enumerate() {
            if let Err(e) = result {
                error!(index, error = %e, "Failed to process comment in batch");
            }
        }
        info!(
            processed = results.iter().filter(|r| r.is_ok()).count(),
            total = count,
            "Batch processing complete"
        );
        results
    }

    /// Record the outcome a platform worker reported for a Shield action.
    pub async fn record_shield_status(
        &self,
        organization_id: &str,
        action_id: Uuid,
        status: ShieldStatus,
    ) -> Result<ShieldAction, Error> {
        let action = self
            .repository
            .update_shield_action_status(organization_id, action_id, status)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { id, .. } => {
                    Error::from(ValidationError::UnknownShieldAction { id })
                }
                DatabaseError::Constraint(reason) => {
                    Error::from(ValidationError::InvalidShieldStatus { reason })
                }
                other => Error::from(other),
            })?;
        info!(
            organization_id,
            action_id = %action.id,
            comment_id = %action.comment_id,
            status = %action.status,
            "Shield action status recorded"
        );
        Ok(action)
    }

    /// Reason to refuse analysis, if the quota is spent or cannot be read.
    async fn quota_denial(&self, organization: &Organization, comment_id: &str) -> Option<&'static str> {
        match self.ledger.can_consume(organization, ANALYSIS_COST).await {
            Ok(check) if check.allowed => None,
            Ok(check) => {
                warn!(
                    organization_id = %organization.id,
                    plan = %organization.plan,
                    comment_id,
                    used = check.used,
                    limit = ?check.limit,
                    "Plan limit exceeded, comment not analyzed"
                );
                Some(REASON_PLAN_LIMIT)
            }
            Err(e) => {
                error!(
                    organization_id = %organization.id,
                    comment_id,
                    error = %e,
                    "Quota check failed, refusing analysis"
                );
                Some(REASON_QUOTA_CHECK_FAILED)
            }
        }
    }

    /// Persist the action and hand it to the Shield worker.
    async fn dispatch_shield(&self, action: ShieldAction) -> Result<ShieldAction, Error> {
        let (stored, created) = self.repository.insert_shield_action(&action).await?;
        if !created {
            info!(
                comment_id = %stored.comment_id,
                action_id = %stored.id,
                "Shield action already stored, re-dispatching"
            );
        }
        self.queue
            .enqueue(Job::Shield {
                action: stored.clone(),
            })
            .await?;
        Ok(stored)
    }
}

fn follow_up_job(decision: &Decision) -> Option<Job> {
    match decision.action {
        DecisionAction::RoastAuto | DecisionAction::RoastManual => Some(Job::RoastGeneration {
            organization_id: decision.organization_id.clone(),
            comment_id: decision.comment_id.clone(),
            requires_approval: decision.action == DecisionAction::RoastManual,
        }),
        DecisionAction::CorrectiveZone => Some(Job::CorrectiveReply {
            organization_id: decision.organization_id.clone(),
            comment_id: decision.comment_id.clone(),
            strike_count: decision.strike_count,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriageConfig;
    use crate::error::ProviderError;
    use crate::pipeline::credits::InMemoryCreditLedger;
    use crate::scoring::{ScoreProvider, ToxicityScore};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    struct FixedProvider(f64);

    #[async_trait]
    impl ScoreProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn score(&self, _text: &str) -> Result<ToxicityScore, ProviderError> {
            Ok(ToxicityScore {
                value: self.0,
                subscores: BTreeMap::new(),
                categories: vec![],
                confidence: 0.9,
                provider: "fixed".into(),
                computed_at: Utc::now(),
            })
        }
    }

    struct Harness {
        processor: CommentProcessor,
        store: Arc<MemoryStore>,
        ledger: Arc<InMemoryCreditLedger>,
        jobs: mpsc::Receiver<Job>,
    }

    fn harness(score: f64) -> Harness {
        harness_with_ledger(score, InMemoryCreditLedger::new())
    }

    fn harness_with_ledger(score: f64, ledger: InMemoryCreditLedger) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(ledger);
        let (queue, jobs) = JobQueue::channel(16);
        let engine = Arc::new(TriageEngine::new(
            Arc::new(FixedProvider(score)),
            store.clone(),
            &TriageConfig::default(),
        ));
        Harness {
            processor: CommentProcessor::new(engine, store.clone(), ledger.clone(), queue),
            store,
            ledger,
            jobs,
        }
    }

    fn org() -> Organization {
        Organization {
            id: "org-1".into(),
            plan: "pro".into(),
        }
    }

    fn user() -> UserContext {
        UserContext {
            id: "system".into(),
            role: Default::default(),
            preferences: serde_json::Value::Null,
        }
    }

    fn inbound(external: &str, text: &str) -> InboundComment {
        InboundComment {
            external_comment_id: external.into(),
            payload: CommentPayload {
                platform: "youtube".into(),
                text: text.into(),
                author_id: "author-1".into(),
                author_username: Some("troll".into()),
            },
        }
    }

    #[tokio::test]
    async fn redelivery_charges_and_dispatches_once() {
        let mut h = harness(0.95);
        let first = h
            .processor
            .process(&org(), &user(), inbound("ext-1", "awful"), AnalyzeOptions::default())
            .await
            .unwrap();
        let second = h
            .processor
            .process(&org(), &user(), inbound("ext-1", "awful"), AnalyzeOptions::default())
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.comment.id, second.comment.id);
        assert!(second.credit.unwrap().already_processed);
        assert!(second.shield.unwrap().already_processed);
        assert_eq!(h.ledger.used("org-1").await, 1);

        let actions = h.store.shield_actions_for_author("org-1", "author-1").await.unwrap();
        assert_eq!(actions.len(), 1);

        assert!(matches!(h.jobs.try_recv(), Ok(Job::Shield { .. })));
        assert!(h.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn manual_roast_requires_approval() {
        let mut h = harness(0.5);
        let processed = h
            .processor
            .process(&org(), &user(), inbound("ext-1", "meh"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(processed.decision.action, DecisionAction::RoastManual);
        assert!(processed.shield.is_none());
        match h.jobs.try_recv().unwrap() {
            Job::RoastGeneration {
                requires_approval, ..
            } => assert!(requires_approval),
            other => panic!("unexpected job {other:?}"),
        }
    }

    #[tokio::test]
    async fn skipped_comment_is_not_charged() {
        let h = harness(0.2);
        let processed = h
            .processor
            .process(
                &org(),
                &user(),
                inbound("ext-1", "<script>alert(1)</script>"),
                AnalyzeOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(processed.decision.action, DecisionAction::Skip);
        assert!(processed.credit.is_none());
        assert_eq!(h.ledger.used("org-1").await, 0);
    }

    #[tokio::test]
    async fn exhausted_quota_skips_without_scoring_or_charge() {
        let mut plans = TriageConfig::default().policy;
        for plan in &mut plans.plans {
            plan.monthly_analysis_limit = Some(1);
        }
        let mut h = harness_with_ledger(0.95, InMemoryCreditLedger::with_plan_limits(plans));

        let first = h
            .processor
            .process(&org(), &user(), inbound("ext-1", "awful"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(first.decision.action, DecisionAction::ShieldCritical);
        assert!(matches!(h.jobs.try_recv(), Ok(Job::Shield { .. })));

        let second = h
            .processor
            .process(&org(), &user(), inbound("ext-2", "awful too"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(second.decision.action, DecisionAction::Skip);
        assert_eq!(second.decision.reasoning, REASON_PLAN_LIMIT);
        assert!(second.decision.toxicity_score.is_none());
        assert!(second.credit.is_none());
        assert!(second.shield.is_none());
        assert_eq!(h.ledger.used("org-1").await, 1);
        assert!(h.jobs.try_recv().is_err());
        assert!(
            h.store
                .get_comment_score("org-1", &second.comment.id)
                .await
                .unwrap()
                .is_none()
        );

        // Redelivery of an already charged comment is not blocked by the quota
        let again = h
            .processor
            .process(&org(), &user(), inbound("ext-1", "awful"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(again.decision.action, DecisionAction::ShieldCritical);
        assert!(again.credit.unwrap().already_processed);
    }

    #[tokio::test]
    async fn failing_quota_lookup_fails_closed() {
        struct BrokenLedger;

        #[async_trait]
        impl CreditLedger for BrokenLedger {
            async fn can_consume(
                &self,
                _: &Organization,
                _: u32,
            ) -> Result<crate::pipeline::credits::QuotaCheck, Error> {
                Err(Error::Internal("billing unavailable".into()))
            }
            async fn deduct(&self, _: &str, _: &str, _: u32) -> Result<CreditReceipt, Error> {
                Err(Error::Internal("billing unavailable".into()))
            }
            async fn used(&self, _: &str) -> u64 {
                0
            }
        }

        let store = Arc::new(MemoryStore::new());
        let (queue, _jobs) = JobQueue::channel(4);
        let engine = Arc::new(TriageEngine::new(
            Arc::new(FixedProvider(0.95)),
            store.clone(),
            &TriageConfig::default(),
        ));
        let processor = CommentProcessor::new(engine, store, Arc::new(BrokenLedger), queue);
        let processed = processor
            .process(&org(), &user(), inbound("ext-1", "awful"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(processed.decision.action, DecisionAction::Skip);
        assert_eq!(processed.decision.reasoning, REASON_QUOTA_CHECK_FAILED);
        assert!(processed.shield.is_none());
    }

    #[tokio::test]
    async fn worker_reports_shield_outcome_once() {
        let mut h = harness(0.95);
        let processed = h
            .processor
            .process(&org(), &user(), inbound("ext-1", "awful"), AnalyzeOptions::default())
            .await
            .unwrap();
        let action = processed.shield.unwrap().value;
        assert!(matches!(h.jobs.try_recv(), Ok(Job::Shield { .. })));

        let executed = h
            .processor
            .record_shield_status("org-1", action.id, ShieldStatus::Executed)
            .await
            .unwrap();
        assert_eq!(executed.status, ShieldStatus::Executed);

        let again = h
            .processor
            .record_shield_status("org-1", action.id, ShieldStatus::Failed)
            .await
            .unwrap_err();
        assert_eq!(again.code(), "INVALID_SHIELD_STATUS");

        let foreign = h
            .processor
            .record_shield_status("org-2", action.id, ShieldStatus::Executed)
            .await
            .unwrap_err();
        assert_eq!(foreign.code(), "SHIELD_ACTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let h = harness(0.2);
        let results = h
            .processor
            .process_batch(
                &org(),
                &user(),
                vec![inbound("ext-1", "hello"), inbound("", "hello"), inbound("ext-3", "  ")],
            )
            .await;
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().code(), "MISSING_FIELD");
        assert_eq!(results[2].as_ref().unwrap_err().code(), "INVALID_CONTENT");
        assert_eq!(h.ledger.used("org-1").await, 1);
    }
}
