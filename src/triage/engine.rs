//! Triage engine: score, classify, route.
//!
//! `TriageEngine::analyze` turns one comment into a `Decision`:
//!
//! 1. validate the text (never scored when invalid)
//! 2. screen for injection payloads (skip)
//! 3. resolve the organization's policy snapshot
//! 4. look up the decision cache
//! 5. reuse the comment's stored score, or score it within per-attempt
//!    timeouts and the caller deadline and store the result
//! 6. classify and route, consulting the reincidence tracker for violations
//! 7. cache and log the decision
//!
//! The first successful score of a comment is authoritative: after a cache
//! expiry or clear the comment is routed again from the same score, so a
//! non-deterministic provider cannot change its decision.
//!
//! Critical content fails closed: if the tracker cannot answer, Shield still
//! blocks the author. Corrective content that cannot be escalated in time
//! becomes an `error` decision instead of a stale first-offense response.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::DecisionCache;
use crate::config::{ShieldConfig, TriageConfig};
use crate::error::{Error, ProviderError, ValidationError};
use crate::policy::{PlanPolicy, PolicySnapshot, PolicyStore};
use crate::scoring::{PatternProvider, RetryingProvider, ScoreProvider, ToxicityScore};
use crate::shield::action::{PRIORITY_CRITICAL, PRIORITY_ESCALATION, ShieldAction, ShieldActionType};
use crate::shield::reincidence::{OffenderState, ReincidenceOutcome, ReincidenceTracker};
use crate::stats::DecisionLog;
use crate::store::traits::{Repository, ScoreRecord};
use crate::triage::classify::classify;
use crate::triage::rules::{ContentRules, SECURITY_PATTERN_REASON};
use crate::triage::types::{
    AnalyzeOptions, Classification, Comment, Decision, DecisionAction, DecisionMetadata,
    MAX_CONTENT_CHARS, Organization, ToxicityBand, UserContext,
};

// ── Reasoning codes ─────────────────────────────────────────────────

pub const REASON_LOW_TOXICITY: &str = "toxicity_below_roast_threshold";
pub const REASON_ROAST_AUTO: &str = "roasteable_auto_approve";
pub const REASON_ROAST_MANUAL: &str = "roasteable_manual_review";
pub const REASON_CRITICAL: &str = "high_toxicity_threshold_exceeded";
pub const REASON_CORRECTIVE: &str = "corrective_first_offense";
pub const REASON_ESCALATED: &str = "repeat_offender_escalation";
pub const REASON_ESCALATION_FAILED: &str = "reincidence_check_failed";

const CONTENT_HASH_KEY: &str = "content_hash";

type Deadline = Option<tokio::time::Instant>;

/// Run `fut` against an optional deadline.
async fn within<T, F>(deadline: Deadline, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Orchestrates scoring, policy, reincidence and caching.
pub struct TriageEngine {
    provider: Arc<dyn ScoreProvider>,
    repository: Arc<dyn Repository>,
    fallback: Option<Arc<dyn ScoreProvider>>,
    policy: PlanPolicy,
    tracker: ReincidenceTracker,
    cache: Arc<DecisionCache>,
    log: Arc<DecisionLog>,
    rules: ContentRules,
    shield: ShieldConfig,
}

impl TriageEngine {
    /// Build an engine. `provider` is wrapped with timeout and retry handling.
    pub fn new(
        provider: Arc<dyn ScoreProvider>,
        repository: Arc<dyn Repository>,
        config: &TriageConfig,
    ) -> Self {
        let fallback: Option<Arc<dyn ScoreProvider>> = if config.scoring.fallback_on_error {
            Some(Arc::new(PatternProvider::new()))
        } else {
            None
        };

        Self {
            provider: Arc::new(RetryingProvider::new(provider, &config.scoring)),
            repository: Arc::clone(&repository),
            fallback,
            policy: PlanPolicy::new(config.policy.clone()),
            tracker: ReincidenceTracker::new(repository, config.reincidence),
            cache: Arc::new(DecisionCache::new(&config.cache)),
            log: Arc::new(DecisionLog::new()),
            rules: ContentRules::default_rules(),
            shield: config.shield,
        }
    }

    /// Resolve organization overrides from `store`.
    pub fn with_policy_store(mut self, config: &TriageConfig, store: Arc<dyn PolicyStore>) -> Self {
        self.policy = PlanPolicy::with_store(config.policy.clone(), store);
        self
    }

    pub fn with_rules(mut self, rules: ContentRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    pub fn log(&self) -> &DecisionLog {
        &self.log
    }

    pub fn tracker(&self) -> &ReincidenceTracker {
        &self.tracker
    }

    /// Analyze one comment.
    ///
    /// Returns `Err` for invalid input, provider failures (unless the
    /// pattern fallback is enabled) and cross-organization access.
    pub async fn analyze(
        &self,
        comment: &Comment,
        organization: &Organization,
        user: &UserContext,
        options: AnalyzeOptions,
    ) -> Result<Decision, Error> {
        let started = Instant::now();
        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let deadline: Deadline = options.deadline.map(|d| tokio::time::Instant::now() + d);

        if comment.organization_id != organization.id {
            warn!(
                correlation_id = %correlation_id,
                comment_org = %comment.organization_id,
                organization_id = %organization.id,
                "Comment belongs to another organization"
            );
            return Err(Error::Forbidden {
                capability: format!("organization:{}", comment.organization_id),
            });
        }
        validate(&comment.text)?;

        let policy = self.policy.resolve(organization).await;

        if let Some(hit) = self.rules.evaluate(comment) {
            let mut decision = self.base_decision(
                comment,
                &policy,
                &correlation_id,
                DecisionAction::Skip,
                SECURITY_PATTERN_REASON,
            );
            decision.confidence = 1.0;
            decision.metadata.insert("screen_rule", hit.description);
            return Ok(self.finish(decision, comment, user, started).await);
        }

        let content_hash = content_hash(&comment.text);
        let fingerprint = self
            .cache
            .fingerprint(&organization.id, &comment.id, &policy.version);
        if let Some(mut cached) = self.cache.get(&fingerprint) {
            if let Some(hash) = cached.metadata.get(CONTENT_HASH_KEY) {
                ensure_same_content(hash, &content_hash)?;
            }
            cached.cache_hit = true;
            cached.correlation_id = correlation_id;
            cached.timestamp = Utc::now();
            return Ok(self.finish(cached, comment, user, started).await);
        }

        let stored = self
            .authoritative_score(comment, &content_hash, deadline, &correlation_id)
            .await?;
        let (score, fallback_used) = (stored.score, stored.fallback_used);
        let classification = classify(score.value, &policy.thresholds, &score.provider)?;

        let mut decision = self
            .route(comment, &policy, &score, classification, deadline, &correlation_id)
            .await;
        decision.fallback_used = fallback_used;
        decision.metadata.insert("provider", score.provider.clone());
        decision.metadata.insert(CONTENT_HASH_KEY, content_hash);

        if decision.action.is_final() {
            self.cache
                .put(fingerprint, decision.clone(), self.cache.default_ttl());
        }
        Ok(self.finish(decision, comment, user, started).await)
    }

    /// Log a skip decision without scoring, e.g. when the plan quota is spent.
    pub async fn skip(
        &self,
        comment: &Comment,
        organization: &Organization,
        user: &UserContext,
        options: AnalyzeOptions,
        reasoning: &str,
    ) -> Decision {
        let started = Instant::now();
        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let policy = self.policy.resolve(organization).await;
        let decision = self.base_decision(
            comment,
            &policy,
            &correlation_id,
            DecisionAction::Skip,
            reasoning,
        );
        self.finish(decision, comment, user, started).await
    }

    // ── Steps ───────────────────────────────────────────────────────

    /// The comment's first successful score, computing and storing it when
    /// there is none yet. Concurrent first analyses converge on whichever
    /// score was stored first.
    async fn authoritative_score(
        &self,
        comment: &Comment,
        content_hash: &str,
        deadline: Deadline,
        correlation_id: &str,
    ) -> Result<ScoreRecord, Error> {
        if let Some(stored) = self
            .repository
            .get_comment_score(&comment.organization_id, &comment.id)
            .await?
        {
            ensure_same_content(&stored.content_hash, content_hash)?;
            debug!(correlation_id, comment_id = %comment.id, "Reusing stored score");
            return Ok(stored);
        }

        let (score, fallback_used) = self.score(&comment.text, deadline, correlation_id).await?;
        let stored = self
            .repository
            .put_comment_score_if_absent(&ScoreRecord {
                organization_id: comment.organization_id.clone(),
                comment_id: comment.id.clone(),
                content_hash: content_hash.to_string(),
                score,
                fallback_used,
            })
            .await?;
        ensure_same_content(&stored.content_hash, content_hash)?;
        Ok(stored)
    }

    async fn score(
        &self,
        text: &str,
        deadline: Deadline,
        correlation_id: &str,
    ) -> Result<(ToxicityScore, bool), ProviderError> {
        let err = match within(deadline, self.provider.score(text)).await {
            Some(Ok(score)) => return Ok((score, false)),
            Some(Err(e)) => e,
            None => ProviderError::DeadlineExceeded,
        };

        match &self.fallback {
            Some(fallback) if !matches!(err, ProviderError::DeadlineExceeded) => {
                warn!(
                    correlation_id,
                    provider = self.provider.name(),
                    error = %err,
                    "Provider failed, using pattern fallback"
                );
                let score = fallback.score(text).await?;
                Ok((score, true))
            }
            _ => Err(err),
        }
    }

    async fn route(
        &self,
        comment: &Comment,
        policy: &PolicySnapshot,
        score: &ToxicityScore,
        classification: Classification,
        deadline: Deadline,
        correlation_id: &str,
    ) -> Decision {
        let (action, reasoning) = match (classification.band, classification.corrective) {
            (ToxicityBand::Light, _) => (DecisionAction::PublishNormal, REASON_LOW_TOXICITY),
            (ToxicityBand::Intermediate, false) if policy.auto_approve => {
                (DecisionAction::RoastAuto, REASON_ROAST_AUTO)
            }
            (ToxicityBand::Intermediate, false) => {
                (DecisionAction::RoastManual, REASON_ROAST_MANUAL)
            }
            (ToxicityBand::Critical, _) => (DecisionAction::ShieldCritical, REASON_CRITICAL),
            (ToxicityBand::Intermediate, true) => {
                (DecisionAction::CorrectiveZone, REASON_CORRECTIVE)
            }
        };

        let mut decision = self.base_decision(comment, policy, correlation_id, action, reasoning);
        decision.toxicity_score = Some(score.value);
        decision.categories = score.categories.clone();
        decision.confidence = score.confidence;
        decision.classification = Some(classification);

        match action {
            DecisionAction::ShieldCritical => {
                self.route_critical(&mut decision, comment, policy, deadline).await
            }
            DecisionAction::CorrectiveZone => {
                self.route_corrective(&mut decision, comment, policy, deadline).await
            }
            _ => {}
        }
        decision
    }

    async fn route_critical(
        &self,
        decision: &mut Decision,
        comment: &Comment,
        policy: &PolicySnapshot,
        deadline: Deadline,
    ) {
        let action_type = match self.record(comment, deadline).await {
            Ok(outcome) => {
                let action_type = match outcome.state {
                    OffenderState::Clean | OffenderState::FirstOffense => ShieldActionType::HideComment,
                    OffenderState::RepeatOffender => ShieldActionType::BlockUser,
                    OffenderState::ChronicOffender => ShieldActionType::ReportUser,
                };
                decision.strike_count = outcome.strike_count;
                decision.reincidence = Some(outcome);
                action_type
            }
            Err(e) => {
                warn!(
                    correlation_id = %decision.correlation_id,
                    comment_id = %comment.id,
                    error = %e,
                    "Reincidence unavailable for critical comment, failing closed"
                );
                decision.metadata.insert("reincidence_error", e.to_string());
                ShieldActionType::BlockUser
            }
        };

        decision.shield_decision =
            self.shield_action(comment, policy, action_type, PRIORITY_CRITICAL, "critical_toxicity");
    }

    async fn route_corrective(
        &self,
        decision: &mut Decision,
        comment: &Comment,
        policy: &PolicySnapshot,
        deadline: Deadline,
    ) {
        let outcome = match self.record(comment, deadline).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    correlation_id = %decision.correlation_id,
                    comment_id = %comment.id,
                    error = %e,
                    "Escalation check failed, refusing corrective decision"
                );
                decision.action = DecisionAction::Error;
                decision.reasoning = REASON_ESCALATION_FAILED.to_string();
                decision.metadata.insert("reincidence_error", e.to_string());
                return;
            }
        };

        decision.strike_count = outcome.strike_count;
        let action_type = match outcome.state {
            OffenderState::RepeatOffender => Some(ShieldActionType::BlockUser),
            OffenderState::ChronicOffender => Some(ShieldActionType::ReportUser),
            OffenderState::Clean | OffenderState::FirstOffense => None,
        };
        if let Some(action_type) = action_type {
            decision.action = DecisionAction::EscalatedReincidence;
            decision.reasoning = REASON_ESCALATED.to_string();
            decision.shield_decision = self.shield_action(
                comment,
                policy,
                action_type,
                PRIORITY_ESCALATION,
                "repeat_offender",
            );
        }
        decision.reincidence = Some(outcome);
    }

    /// Record a violation within the caller deadline.
    async fn record(&self, comment: &Comment, deadline: Deadline) -> Result<ReincidenceOutcome, Error> {
        let recorded = within(
            deadline,
            self.tracker
                .record_violation(&comment.organization_id, &comment.author_id, &comment.id),
        )
        .await;
        recorded.unwrap_or_else(|| Err(ProviderError::DeadlineExceeded.into()))
    }

    fn shield_action(
        &self,
        comment: &Comment,
        policy: &PolicySnapshot,
        action_type: ShieldActionType,
        priority: u8,
        reason: &str,
    ) -> Option<ShieldAction> {
        policy.shield_enabled.then(|| {
            ShieldAction::new(
                &comment.organization_id,
                &comment.id,
                &comment.author_id,
                action_type,
                priority,
                reason,
                self.shield.dry_run,
            )
        })
    }

    fn base_decision(
        &self,
        comment: &Comment,
        policy: &PolicySnapshot,
        correlation_id: &str,
        action: DecisionAction,
        reasoning: &str,
    ) -> Decision {
        let mut metadata = DecisionMetadata::default();
        metadata.insert("platform", comment.platform.clone());
        metadata.insert("policy_source", policy.source.as_str());

        Decision {
            action,
            reasoning: reasoning.to_string(),
            comment_id: comment.id.clone(),
            organization_id: comment.organization_id.clone(),
            toxicity_score: None,
            categories: Vec::new(),
            confidence: 0.0,
            classification: None,
            plan: policy.plan_name.clone(),
            plan_threshold: policy.thresholds.roast_lower,
            policy_version: policy.version.clone(),
            shield_decision: None,
            reincidence: None,
            strike_count: 0,
            fallback_used: false,
            correlation_id: correlation_id.to_string(),
            timestamp: Utc::now(),
            cache_hit: false,
            decision_time_ms: 0,
            metadata,
        }
    }

    /// Stamp timing, record stats and write the audit line.
    async fn finish(
        &self,
        mut decision: Decision,
        comment: &Comment,
        user: &UserContext,
        started: Instant,
    ) -> Decision {
        decision.decision_time_ms = started.elapsed().as_millis() as u64;
        self.log.record(&decision).await;

        info!(
            correlation_id = %decision.correlation_id,
            organization_id = %decision.organization_id,
            comment_id = %decision.comment_id,
            user_id = %user.id,
            plan = %decision.plan,
            action = %decision.action,
            toxicity_score = ?decision.toxicity_score,
            strike_count = decision.strike_count,
            shield = decision.shield_decision.is_some(),
            cache_hit = decision.cache_hit,
            content_length = comment.text.chars().count(),
            decision_time_ms = decision.decision_time_ms,
            "Triage decision completed"
        );
        decision
    }
}

fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex()[..32].to_string()
}

/// A comment id is bound to the text it was first scored with.
fn ensure_same_content(stored: &str, current: &str) -> Result<(), ValidationError> {
    if stored == current {
        Ok(())
    } else {
        Err(ValidationError::ContentMismatch {
            field: "content".into(),
        })
    }
}

fn validate(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::InvalidContent {
            field: "content".into(),
        });
    }
    let length = text.chars().count();
    if length > MAX_CONTENT_CHARS {
        return Err(ValidationError::ContentTooLong {
            field: "content".into(),
            length,
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(())
}
