//! Repeat-offense tracking per (organization, author).
//!
//! Each violation advances the author's strike counter through
//! `clean -> first_offense -> repeat_offender -> chronic_offender`. Strike
//! increments for one author are serialized twice over: a per-author lock
//! inside this process, and a compare-and-set on the stored counter for
//! writers that share the repository. Lost races and busy storage are
//! retried with jittered backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ReincidenceConfig;
use crate::error::{ConcurrencyError, DatabaseError, Error};
use crate::locks::KeyedLocks;
use crate::store::traits::{Repository, StrikeWrite, ViolationRecord};

/// Compare-and-set attempts before giving up on a strike increment.
const MAX_CAS_ATTEMPTS: u32 = 10;

/// Sleep before the next attempt: exponential with full jitter, capped.
fn cas_backoff(attempt: u32) -> Duration {
    let cap_ms = 2u64.saturating_pow(attempt.min(6));
    Duration::from_millis(rand::thread_rng().gen_range(1..=cap_ms))
}

/// Offender state derived from a strike count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffenderState {
    Clean,
    FirstOffense,
    RepeatOffender,
    ChronicOffender,
}

impl OffenderState {
    pub fn from_strikes(strikes: u32, config: &ReincidenceConfig) -> Self {
        if strikes >= config.chronic_offender_strikes {
            Self::ChronicOffender
        } else if strikes >= config.repeat_offender_strikes {
            Self::RepeatOffender
        } else if strikes >= config.first_offense_strikes {
            Self::FirstOffense
        } else {
            Self::Clean
        }
    }

    pub fn recommended_action(&self) -> RecommendedAction {
        match self {
            Self::Clean | Self::FirstOffense => RecommendedAction::CorrectiveResponse,
            Self::RepeatOffender => RecommendedAction::ShieldBlock,
            Self::ChronicOffender => RecommendedAction::ShieldReport,
        }
    }
}

/// What the tracker suggests doing about the author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    CorrectiveResponse,
    ShieldBlock,
    ShieldReport,
}

/// Result of recording one violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReincidenceOutcome {
    pub strike_count: u32,
    pub state: OffenderState,
    pub previous_state: OffenderState,
    /// True only when this violation crossed into repeat or chronic.
    pub escalated: bool,
    pub recommended_action: RecommendedAction,
    /// The comment had already been recorded; nothing changed.
    pub duplicate: bool,
}

/// Strike counter and violation history per author.
pub struct ReincidenceTracker {
    repository: Arc<dyn Repository>,
    config: ReincidenceConfig,
    locks: KeyedLocks,
}

impl ReincidenceTracker {
    pub fn new(repository: Arc<dyn Repository>, config: ReincidenceConfig) -> Self {
        Self {
            repository,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &ReincidenceConfig {
        &self.config
    }

    /// Record a violation for `comment_id`. Idempotent per comment.
    pub async fn record_violation(
        &self,
        organization_id: &str,
        author_id: &str,
        comment_id: &str,
    ) -> Result<ReincidenceOutcome, Error> {
        let _guard = self
            .locks
            .lock(&format!("{organization_id}:{author_id}"))
            .await;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(cas_backoff(attempt)).await;
            }

            let current = match self
                .repository
                .strike_count(organization_id, author_id)
                .await
            {
                Ok(current) => current,
                Err(DatabaseError::Busy(reason)) => {
                    debug!(organization_id, author_id, attempt, %reason, "Strike read busy, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let next = current.saturating_add(1);
            let outcome = self.outcome(current, next, false);

            let record = ViolationRecord {
                author_id: author_id.to_string(),
                organization_id: organization_id.to_string(),
                comment_id: comment_id.to_string(),
                occurred_at: Utc::now(),
                escalated: outcome.escalated,
                strike_count: next,
            };

            let written = match self.repository.append_violation(&record, current).await {
                Ok(written) => written,
                Err(DatabaseError::Busy(reason)) => {
                    debug!(organization_id, author_id, attempt, %reason, "Strike write busy, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match written {
                StrikeWrite::Applied => {
                    if outcome.escalated {
                        info!(
                            organization_id,
                            author_id,
                            strike_count = next,
                            state = ?outcome.state,
                            "Author escalated"
                        );
                    } else {
                        debug!(organization_id, author_id, strike_count = next, "Strike recorded");
                    }
                    return Ok(outcome);
                }
                StrikeWrite::Duplicate(existing) => {
                    debug!(organization_id, comment_id, "Violation already recorded");
                    let strikes = existing.strike_count;
                    let mut outcome = self.outcome(strikes.saturating_sub(1), strikes, true);
                    outcome.escalated = existing.escalated;
                    return Ok(outcome);
                }
                StrikeWrite::Conflict { current } => {
                    warn!(
                        organization_id,
                        author_id,
                        attempt,
                        current,
                        "Strike counter moved concurrently, retrying"
                    );
                }
            }
        }

        Err(ConcurrencyError::StrikeConflict {
            organization_id: organization_id.to_string(),
            author_id: author_id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Current offender state for an author.
    pub async fn state(&self, organization_id: &str, author_id: &str) -> Result<OffenderState, Error> {
        let strikes = self
            .repository
            .strike_count(organization_id, author_id)
            .await?;
        Ok(OffenderState::from_strikes(strikes, &self.config))
    }

    /// Violation history, oldest first.
    pub async fn history(
        &self,
        organization_id: &str,
        author_id: &str,
    ) -> Result<Vec<ViolationRecord>, Error> {
        Ok(self
            .repository
            .violations_for_author(organization_id, author_id)
            .await?)
    }

    fn outcome(&self, before: u32, after: u32, duplicate: bool) -> ReincidenceOutcome {
        let previous_state = OffenderState::from_strikes(before, &self.config);
        let state = OffenderState::from_strikes(after, &self.config);
        ReincidenceOutcome {
            strike_count: after,
            state,
            previous_state,
            escalated: state != previous_state && state >= OffenderState::RepeatOffender,
            recommended_action: state.recommended_action(),
            duplicate,
        }
    }
}
