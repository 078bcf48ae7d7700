//! End-to-end triage flows against the in-memory and libSQL stores.
//!
//! Comments encode their score as the first word ("0.95 you are awful");
//! a first word of "fail" makes the provider return 503.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;

use triage_shield::api::service::{AnalyzeRequest, BatchRequest};
use triage_shield::api::{RequestContext, TriageService};
use triage_shield::config::TriageConfig;
use triage_shield::error::ProviderError;
use triage_shield::pipeline::{
    CommentProcessor, CreditLedger, InMemoryCreditLedger, InboundComment, JobQueue,
};
use triage_shield::policy::{OrganizationPolicies, OrganizationPolicy};
use triage_shield::scoring::{ScoreProvider, ToxicityScore};
use triage_shield::shield::ShieldActionType;
use triage_shield::store::{LibSqlBackend, MemoryStore, Repository};
use triage_shield::triage::types::CommentPayload;
use triage_shield::triage::{
    AnalyzeOptions, Comment, DecisionAction, Organization, Role, TriageEngine, UserContext,
};

/// Reads the score from the comment's first word.
struct ScriptedProvider;

#[async_trait]
impl ScoreProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn score(&self, text: &str) -> Result<ToxicityScore, ProviderError> {
        let first = text.split_whitespace().next().unwrap_or_default();
        if first == "fail" {
            return Err(ProviderError::Unavailable {
                provider: "scripted".into(),
                reason: "HTTP 503".into(),
            });
        }
        Ok(ToxicityScore {
            value: first.parse().unwrap_or(0.1),
            subscores: BTreeMap::new(),
            categories: vec![],
            confidence: 0.9,
            provider: "scripted".into(),
            computed_at: Utc::now(),
        })
    }
}

/// Scores low on the first call and critical on every later one.
struct DriftingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl ScoreProvider for DriftingProvider {
    fn name(&self) -> &str {
        "drifting"
    }

    async fn score(&self, _text: &str) -> Result<ToxicityScore, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToxicityScore {
            value: if call == 0 { 0.2 } else { 0.95 },
            subscores: BTreeMap::new(),
            categories: vec![],
            confidence: 0.9,
            provider: "drifting".into(),
            computed_at: Utc::now(),
        })
    }
}

fn config() -> TriageConfig {
    let mut config = TriageConfig::default();
    config.scoring.retry_base_delay = Duration::from_millis(1);
    config
}

fn engine(store: Arc<dyn Repository>) -> TriageEngine {
    TriageEngine::new(Arc::new(ScriptedProvider), store, &config())
}

fn org(id: &str) -> Organization {
    Organization {
        id: id.into(),
        plan: "pro".into(),
    }
}

fn user(role: Role) -> UserContext {
    UserContext {
        id: "user-1".into(),
        role,
        preferences: serde_json::Value::Null,
    }
}

fn comment(org_id: &str, id: &str, author: &str, text: &str) -> Comment {
    Comment {
        id: id.into(),
        organization_id: org_id.into(),
        external_comment_id: format!("ext-{id}"),
        platform: "twitter".into(),
        text: text.into(),
        author_id: author.into(),
        author_username: None,
        created_at: Utc::now(),
    }
}

fn inbound(external: &str, author: &str, text: &str) -> InboundComment {
    InboundComment {
        external_comment_id: external.into(),
        payload: CommentPayload {
            platform: "twitter".into(),
            text: text.into(),
            author_id: author.into(),
            author_username: None,
        },
    }
}

#[tokio::test]
async fn scenario_table() {
    let engine = engine(Arc::new(MemoryStore::new()));
    let user = user(Role::Member);

    let d = engine
        .analyze(&comment("org-1", "c1", "a1", "0.2 nice stream"), &org("org-1"), &user, AnalyzeOptions::default())
        .await
        .unwrap();
    assert_eq!(d.action, DecisionAction::PublishNormal);
    assert!(d.shield_decision.is_none());

    let d = engine
        .analyze(&comment("org-1", "c2", "a2", "0.95 vile"), &org("org-1"), &user, AnalyzeOptions::default())
        .await
        .unwrap();
    assert_eq!(d.action, DecisionAction::ShieldCritical);
    let shield = d.shield_decision.unwrap();
    assert_eq!(shield.priority, 1);
    assert!(matches!(
        shield.action_type,
        ShieldActionType::HideComment | ShieldActionType::BlockUser | ShieldActionType::ReportUser
    ));

    let first = engine
        .analyze(&comment("org-1", "c3", "a3", "0.75 borderline"), &org("org-1"), &user, AnalyzeOptions::default())
        .await
        .unwrap();
    let second = engine
        .analyze(&comment("org-1", "c4", "a3", "0.72 borderline"), &org("org-1"), &user, AnalyzeOptions::default())
        .await
        .unwrap();
    assert_eq!(first.action, DecisionAction::CorrectiveZone);
    assert_eq!(first.strike_count, 1);
    assert_eq!(second.action, DecisionAction::EscalatedReincidence);
    assert_eq!(second.strike_count, 2);
    assert!(second.shield_decision.is_some());
}

#[tokio::test]
async fn auto_approve_override_roasts() {
    let config = config();
    let overrides = Arc::new(OrganizationPolicies::new());
    overrides
        .set(
            "org-1",
            OrganizationPolicy {
                auto_approve: Some(true),
                ..Default::default()
            },
        )
        .await;
    let engine = TriageEngine::new(Arc::new(ScriptedProvider), Arc::new(MemoryStore::new()), &config)
        .with_policy_store(&config, overrides.clone());

    let c = comment("org-1", "c1", "a1", "0.5 meh");
    let d = engine
        .analyze(&c, &org("org-1"), &user(Role::Member), AnalyzeOptions::default())
        .await
        .unwrap();
    assert_eq!(d.action, DecisionAction::RoastAuto);

    // Policy edits change the version, so the cached decision is not reused
    overrides.remove("org-1").await;
    let d = engine
        .analyze(&c, &org("org-1"), &user(Role::Member), AnalyzeOptions::default())
        .await
        .unwrap();
    assert!(!d.cache_hit);
    assert_eq!(d.action, DecisionAction::RoastManual);
}

#[tokio::test]
async fn escalation_is_monotonic() {
    let engine = engine(Arc::new(MemoryStore::new()));
    let mut strikes = Vec::new();
    let mut escalations = Vec::new();

    for i in 0..6 {
        let d = engine
            .analyze(
                &comment("org-1", &format!("c{i}"), "a1", "0.75 borderline"),
                &org("org-1"),
                &user(Role::Member),
                AnalyzeOptions::default(),
            )
            .await
            .unwrap();
        strikes.push(d.strike_count);
        escalations.push(d.reincidence.unwrap().escalated);
    }

    assert_eq!(strikes, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(escalations, vec![false, true, false, false, true, false]);
}

#[tokio::test]
async fn concurrent_violations_do_not_lose_strikes() {
    let engine = Arc::new(engine(Arc::new(MemoryStore::new())));
    let comments: Vec<Comment> = (0..10)
        .map(|i| comment("org-1", &format!("c{i}"), "a1", "0.95 vile"))
        .collect();

    let decisions = join_all(comments.iter().map(|c| {
        let engine = Arc::clone(&engine);
        async move {
            engine
                .analyze(c, &org("org-1"), &user(Role::Member), AnalyzeOptions::default())
                .await
                .unwrap()
        }
    }))
    .await;

    let mut strikes: Vec<u32> = decisions.iter().map(|d| d.strike_count).collect();
    strikes.sort_unstable();
    assert_eq!(strikes, (1..=10).collect::<Vec<u32>>());

    let hides = decisions
        .iter()
        .filter(|d| {
            d.shield_decision
                .as_ref()
                .is_some_and(|s| s.action_type == ShieldActionType::HideComment)
        })
        .count();
    assert_eq!(hides, 1);
}

#[tokio::test]
async fn cross_org_isolation() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(engine(store.clone()));
    let (queue, _jobs) = JobQueue::channel(16);
    let processor = CommentProcessor::new(
        engine,
        store,
        Arc::new(InMemoryCreditLedger::new()),
        queue,
    );
    let user = user(Role::Member);

    let a = processor
        .process(&org("org-a"), &user, inbound("ext-1", "troll", "0.75 borderline"), AnalyzeOptions::default())
        .await
        .unwrap();
    let b = processor
        .process(&org("org-b"), &user, inbound("ext-1", "troll", "0.75 borderline"), AnalyzeOptions::default())
        .await
        .unwrap();

    assert_ne!(a.comment.id, b.comment.id);
    assert!(a.created && b.created);
    assert_eq!(a.decision.organization_id, "org-a");
    assert_eq!(b.decision.organization_id, "org-b");
    // Strikes are per organization
    assert_eq!(a.decision.strike_count, 1);
    assert_eq!(b.decision.strike_count, 1);
}

#[tokio::test]
async fn duplicate_delivery_has_single_effect_on_libsql() {
    let store: Arc<dyn Repository> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let engine = Arc::new(engine(Arc::clone(&store)));
    let ledger = Arc::new(InMemoryCreditLedger::new());
    let (queue, mut jobs) = JobQueue::channel(16);
    let processor = CommentProcessor::new(engine, Arc::clone(&store), ledger.clone(), queue);
    let user = user(Role::Member);

    let mut deliveries = Vec::new();
    for _ in 0..3 {
        let processed = processor
            .process(&org("org-1"), &user, inbound("ext-9", "troll", "0.95 vile"), AnalyzeOptions::default())
            .await
            .unwrap();
        deliveries.push(processed);
    }

    assert!(deliveries.iter().all(|p| p.comment.id == deliveries[0].comment.id));
    assert_eq!(deliveries.iter().filter(|p| p.created).count(), 1);
    assert!(deliveries[2].credit.as_ref().unwrap().already_processed);

    assert_eq!(ledger.used("org-1").await, 1);
    let actions = store.shield_actions_for_author("org-1", "troll").await.unwrap();
    assert_eq!(actions.len(), 1);

    let mut shield_jobs = 0;
    while jobs.try_recv().is_ok() {
        shield_jobs += 1;
    }
    assert_eq!(shield_jobs, 1);
}

#[tokio::test]
async fn cache_hit_until_clear() {
    let engine = engine(Arc::new(MemoryStore::new()));
    let c = comment("org-1", "c1", "a1", "0.4 hmm");
    let user = user(Role::Member);

    let first = engine.analyze(&c, &org("org-1"), &user, AnalyzeOptions::default()).await.unwrap();
    let second = engine.analyze(&c, &org("org-1"), &user, AnalyzeOptions::default()).await.unwrap();
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(engine.cache().stats().hits, 1);

    engine.cache().clear();
    let third = engine.analyze(&c, &org("org-1"), &user, AnalyzeOptions::default()).await.unwrap();
    assert!(!third.cache_hit);
    assert!(first.same_outcome(&third));
}

#[tokio::test]
async fn batch_partial_failure() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(engine(store.clone()));
    let (queue, _jobs) = JobQueue::channel(16);
    let processor = Arc::new(CommentProcessor::new(
        engine.clone(),
        store,
        Arc::new(InMemoryCreditLedger::new()),
        queue,
    ));
    let service = TriageService::new(engine, processor);
    let ctx = RequestContext::new(org("org-1"), user(Role::Member));

    let request = BatchRequest {
        comments: vec![
            AnalyzeRequest::default(),
            AnalyzeRequest {
                content: Some("0.2 lovely".into()),
                ..Default::default()
            },
            AnalyzeRequest {
                content: Some("fail please".into()),
                ..Default::default()
            },
        ],
        options: None,
    };
    let response = service.batch(&ctx, request).await.unwrap();

    assert_eq!(response.summary.total_comments, 3);
    assert_eq!(response.summary.successful_analyses, 1);
    assert_eq!(response.summary.failed_analyses, 2);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].index, 1);
    assert_eq!(response.results[0].decision.action, DecisionAction::PublishNormal);

    assert_eq!(response.errors[0].index, 0);
    assert_eq!(response.errors[0].error.code, "INVALID_CONTENT");
    assert_eq!(response.errors[1].index, 2);
    assert_eq!(response.errors[1].error.code, "PROVIDER_UNAVAILABLE");
    assert!(response.errors[1].error.retry_after.is_some());
}

#[tokio::test]
async fn redelivery_after_cache_expiry_keeps_first_score() {
    let mut config = config();
    config.cache.ttl = Duration::from_millis(20);
    let store: Arc<dyn Repository> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let provider = Arc::new(DriftingProvider {
        calls: AtomicUsize::new(0),
    });
    let ledger = Arc::new(InMemoryCreditLedger::new());
    let (queue, mut jobs) = JobQueue::channel(16);
    let engine = Arc::new(TriageEngine::new(provider.clone(), Arc::clone(&store), &config));
    let processor = CommentProcessor::new(engine, Arc::clone(&store), ledger.clone(), queue.clone());
    let user = user(Role::Member);

    let first = processor
        .process(&org("org-1"), &user, inbound("ext-1", "troll", "you again"), AnalyzeOptions::default())
        .await
        .unwrap();
    assert_eq!(first.decision.action, DecisionAction::PublishNormal);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = processor
        .process(&org("org-1"), &user, inbound("ext-1", "troll", "you again"), AnalyzeOptions::default())
        .await
        .unwrap();
    assert!(!second.created);
    assert!(!second.decision.cache_hit);
    assert!(first.decision.same_outcome(&second.decision));
    assert!(second.shield.is_none());
    assert!(second.credit.unwrap().already_processed);

    // A fresh engine over the same store, as after a restart
    let restarted = Arc::new(TriageEngine::new(provider.clone(), Arc::clone(&store), &config));
    let processor = CommentProcessor::new(restarted, Arc::clone(&store), ledger.clone(), queue);
    let third = processor
        .process(&org("org-1"), &user, inbound("ext-1", "troll", "you again"), AnalyzeOptions::default())
        .await
        .unwrap();
    assert_eq!(third.decision.action, DecisionAction::PublishNormal);

    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.used("org-1").await, 1);
    assert!(store.shield_actions_for_author("org-1", "troll").await.unwrap().is_empty());
    assert!(store.violations_for_author("org-1", "troll").await.unwrap().is_empty());
    assert!(jobs.try_recv().is_err());
}
