//! Shield actions and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protective action against an abusive author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldActionType {
    HideComment,
    BlockUser,
    ReportUser,
}

impl ShieldActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HideComment => "hide_comment",
            Self::BlockUser => "block_user",
            Self::ReportUser => "report_user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hide_comment" => Some(Self::HideComment),
            "block_user" => Some(Self::BlockUser),
            "report_user" => Some(Self::ReportUser),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShieldActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a Shield action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldStatus {
    /// Waiting for a worker to execute it on the platform.
    Pending,
    /// Computed and logged only.
    DryRunCompleted,
    Executed,
    Failed,
}

impl ShieldStatus {
    pub fn can_transition_to(&self, target: ShieldStatus) -> bool {
        use ShieldStatus::*;

        matches!((self, target), (Pending, Executed) | (Pending, Failed))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::DryRunCompleted => "dry_run_completed",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "dry_run_completed" => Some(Self::DryRunCompleted),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShieldStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority for critical content.
pub const PRIORITY_CRITICAL: u8 = 1;
/// Priority for escalated reincidence.
pub const PRIORITY_ESCALATION: u8 = 2;

/// A decided Shield action. Execution happens in a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShieldAction {
    /// Derived from organization, comment and action type.
    pub id: Uuid,
    pub comment_id: String,
    pub organization_id: String,
    pub author_id: String,
    pub action_type: ShieldActionType,
    /// 1 = highest.
    pub priority: u8,
    pub reason: String,
    pub status: ShieldStatus,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

impl ShieldAction {
    /// Build a new action. Dry-run actions are terminal from the start.
    pub fn new(
        organization_id: &str,
        comment_id: &str,
        author_id: &str,
        action_type: ShieldActionType,
        priority: u8,
        reason: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            id: Self::derive_id(organization_id, comment_id, action_type),
            comment_id: comment_id.to_string(),
            organization_id: organization_id.to_string(),
            author_id: author_id.to_string(),
            action_type,
            priority,
            reason: reason.into(),
            status: if dry_run {
                ShieldStatus::DryRunCompleted
            } else {
                ShieldStatus::Pending
            },
            dry_run,
            created_at: Utc::now(),
        }
    }

    /// Stable id so that recomputing a decision yields the same action.
    pub fn derive_id(organization_id: &str, comment_id: &str, action_type: ShieldActionType) -> Uuid {
        let name = format!("{organization_id}:{comment_id}:{action_type}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// Move to a new status if the transition is allowed.
    pub fn transition_to(&mut self, target: ShieldStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition shield action {} from {} to {}",
                self.id, self.status, target
            ));
        }
        self.status = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_starts_terminal() {
        let action = ShieldAction::new("org", "c1", "a1", ShieldActionType::HideComment, 1, "r", true);
        assert_eq!(action.status, ShieldStatus::DryRunCompleted);
        assert!(action.status.is_terminal());
    }

    #[test]
    fn pending_transitions() {
        let mut action = ShieldAction::new("org", "c1", "a1", ShieldActionType::BlockUser, 1, "r", false);
        assert_eq!(action.status, ShieldStatus::Pending);
        assert!(action.transition_to(ShieldStatus::Executed).is_ok());
        assert!(action.transition_to(ShieldStatus::Failed).is_err());
    }

    #[test]
    fn dry_run_cannot_execute() {
        assert!(!ShieldStatus::DryRunCompleted.can_transition_to(ShieldStatus::Executed));
    }

    #[test]
    fn id_is_deterministic_and_scoped() {
        let a = ShieldAction::derive_id("org-1", "c1", ShieldActionType::HideComment);
        assert_eq!(a, ShieldAction::derive_id("org-1", "c1", ShieldActionType::HideComment));
        assert_ne!(a, ShieldAction::derive_id("org-2", "c1", ShieldActionType::HideComment));
        assert_ne!(a, ShieldAction::derive_id("org-1", "c1", ShieldActionType::BlockUser));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            ShieldStatus::Pending,
            ShieldStatus::DryRunCompleted,
            ShieldStatus::Executed,
            ShieldStatus::Failed,
        ] {
            assert_eq!(ShieldStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ShieldActionType::parse("report_user"), Some(ShieldActionType::ReportUser));
    }
}
