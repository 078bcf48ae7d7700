use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use triage_shield::api::{TriageService, triage_routes};
use triage_shield::config::TriageConfig;
use triage_shield::pipeline::queue::DEFAULT_QUEUE_CAPACITY;
use triage_shield::pipeline::{CommentProcessor, InMemoryCreditLedger, Job, JobQueue};
use triage_shield::policy::OrganizationPolicies;
use triage_shield::scoring::{PatternProvider, PerspectiveProvider, ScoreProvider};
use triage_shield::store::{LibSqlBackend, Repository};
use triage_shield::triage::TriageEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = TriageConfig::from_env().context("invalid TRIAGE_* configuration")?;

    eprintln!("🛡️  Triage & Shield v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/triage", config.server.port);
    eprintln!("   Database: {}", config.server.db_path.display());
    eprintln!("   Shield dry run: {}", config.shield.dry_run);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Repository> = Arc::new(
        LibSqlBackend::new_local(&config.server.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.server.db_path.display()))?,
    );

    // ── Scoring ──────────────────────────────────────────────────────────
    let provider: Arc<dyn ScoreProvider> = match &config.scoring.perspective_api_key {
        Some(key) => Arc::new(PerspectiveProvider::new(key.clone())),
        None => {
            eprintln!("   PERSPECTIVE_API_KEY not set, scoring with local patterns");
            Arc::new(PatternProvider::new())
        }
    };
    eprintln!("   Scoring: {}", provider.name());

    // ── Policy overrides ─────────────────────────────────────────────────
    let overrides = match &config.server.policy_file {
        Some(path) => {
            eprintln!("   Policy overrides: {}", path.display());
            OrganizationPolicies::load(path)
                .await
                .context("failed to load organization policies")?
        }
        None => OrganizationPolicies::new(),
    };

    // ── Engine and pipeline ──────────────────────────────────────────────
    let engine = Arc::new(
        TriageEngine::new(provider, Arc::clone(&store), &config)
            .with_policy_store(&config, Arc::new(overrides)),
    );
    let (queue, mut jobs) = JobQueue::channel(DEFAULT_QUEUE_CAPACITY);
    let processor = Arc::new(CommentProcessor::new(
        Arc::clone(&engine),
        store,
        Arc::new(InMemoryCreditLedger::with_plan_limits(config.policy.clone())),
        queue,
    ));

    // Platform workers are external; log what would be handed to them
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            match &job {
                Job::Shield { action } => info!(
                    action_id = %action.id,
                    action_type = %action.action_type,
                    priority = action.priority,
                    dry_run = action.dry_run,
                    "Shield job ready for worker"
                ),
                other => info!(job = other.label(), comment_id = other.comment_id(), "Job ready for worker"),
            }
        }
    });

    // ── HTTP ─────────────────────────────────────────────────────────────
    let service = Arc::new(TriageService::new(engine, processor));
    let app = triage_routes(service);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.server.port))?;
    info!(port = config.server.port, "Triage server started");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
