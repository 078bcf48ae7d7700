//! Shared types for comment triage.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shield::action::ShieldAction;
use crate::shield::reincidence::ReincidenceOutcome;

/// Maximum comment length in characters.
pub const MAX_CONTENT_CHARS: usize = 10_000;

// ── Inbound comment ─────────────────────────────────────────────────

/// A social-media comment owned by one organization.
///
/// `(organization_id, external_comment_id)` is unique; the same external id
/// in another organization is a different comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// Internal id (UUID), distinct across organizations.
    pub id: String,
    pub organization_id: String,
    /// Platform-native comment id.
    pub external_comment_id: String,
    /// Source platform: "twitter", "youtube", "api", ...
    pub platform: String,
    pub text: String,
    pub author_id: String,
    pub author_username: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Payload delivered by a platform connector, before ingestion assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub platform: String,
    pub text: String,
    pub author_id: String,
    #[serde(default)]
    pub author_username: Option<String>,
}

// ── Caller context ──────────────────────────────────────────────────

/// Organization context, as established by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub plan: String,
}

/// Role of the calling user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    Member,
}

/// Calling user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub preferences: serde_json::Value,
}

impl UserContext {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Per-call options for `TriageEngine::analyze`.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Reuse a caller-supplied correlation id instead of minting one.
    pub correlation_id: Option<String>,
    /// Caller deadline for the whole analysis.
    pub deadline: Option<Duration>,
}

// ── Classification ──────────────────────────────────────────────────

/// Toxicity band derived from a score and the plan's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToxicityBand {
    Light,
    Intermediate,
    Critical,
}

/// Band plus the corrective tag for borderline intermediate content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub band: ToxicityBand,
    pub corrective: bool,
}

impl Classification {
    pub fn light() -> Self {
        Self {
            band: ToxicityBand::Light,
            corrective: false,
        }
    }

    pub fn roasteable() -> Self {
        Self {
            band: ToxicityBand::Intermediate,
            corrective: false,
        }
    }

    pub fn corrective() -> Self {
        Self {
            band: ToxicityBand::Intermediate,
            corrective: true,
        }
    }

    pub fn critical() -> Self {
        Self {
            band: ToxicityBand::Critical,
            corrective: false,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match (self.band, self.corrective) {
            (ToxicityBand::Light, _) => "light",
            (ToxicityBand::Intermediate, false) => "roasteable",
            (ToxicityBand::Intermediate, true) => "corrective",
            (ToxicityBand::Critical, _) => "critical",
        }
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Routing outcome for a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    PublishNormal,
    RoastAuto,
    RoastManual,
    ShieldCritical,
    CorrectiveZone,
    EscalatedReincidence,
    Skip,
    Error,
}

impl DecisionAction {
    pub const ALL: [DecisionAction; 8] = [
        Self::PublishNormal,
        Self::RoastAuto,
        Self::RoastManual,
        Self::ShieldCritical,
        Self::CorrectiveZone,
        Self::EscalatedReincidence,
        Self::Skip,
        Self::Error,
    ];

    /// Short label for logging and stats keys.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PublishNormal => "publish_normal",
            Self::RoastAuto => "roast_auto",
            Self::RoastManual => "roast_manual",
            Self::ShieldCritical => "shield_critical",
            Self::CorrectiveZone => "corrective_zone",
            Self::EscalatedReincidence => "escalated_reincidence",
            Self::Skip => "skip",
            Self::Error => "error",
        }
    }

    /// Whether the comment was actually triaged (credits apply, cacheable).
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Skip | Self::Error)
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Maximum number of free-form metadata entries on a decision.
pub const MAX_METADATA_ENTRIES: usize = 16;

/// Bounded string map for diagnostics that don't warrant a typed field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionMetadata(BTreeMap<String, String>);

impl DecisionMetadata {
    /// Insert an entry. Returns false (and drops the entry) when full.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.0.len() >= MAX_METADATA_ENTRIES && !self.0.contains_key(&key) {
            return false;
        }
        self.0.insert(key, value.into());
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The triage decision for one comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    /// Machine-readable reason, e.g. `high_toxicity_threshold_exceeded`.
    pub reasoning: String,
    pub comment_id: String,
    pub organization_id: String,
    pub toxicity_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub plan: String,
    /// Roast lower bound used for this plan.
    pub plan_threshold: f64,
    pub policy_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shield_decision: Option<ShieldAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reincidence: Option<ReincidenceOutcome>,
    pub strike_count: u32,
    pub fallback_used: bool,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub cache_hit: bool,
    pub decision_time_ms: u64,
    #[serde(default, skip_serializing_if = "DecisionMetadata::is_empty")]
    pub metadata: DecisionMetadata,
}

impl Decision {
    /// Equality on the fields that determine what happens to the comment.
    ///
    /// Ignores correlation id, timing, cache flags and timestamps.
    pub fn same_outcome(&self, other: &Decision) -> bool {
        self.action == other.action
            && self.reasoning == other.reasoning
            && self.comment_id == other.comment_id
            && self.organization_id == other.organization_id
            && self.toxicity_score == other.toxicity_score
            && self.classification == other.classification
            && self.plan == other.plan
            && self.plan_threshold == other.plan_threshold
            && self.strike_count == other.strike_count
            && self.shield_decision.as_ref().map(|s| (s.id, s.action_type))
                == other.shield_decision.as_ref().map(|s| (s.id, s.action_type))
    }
}
