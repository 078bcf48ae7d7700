//! Plan-tier policy resolution.
//!
//! `PlanPolicy` turns an organization into a read-only `PolicySnapshot`:
//! classification thresholds plus the `auto_approve` / `shield_enabled`
//! toggles. The plan table supplies defaults; per-organization overrides
//! come from a `PolicyStore`. Resolution never fails: unknown plans, lookup
//! errors and inconsistent overrides all produce a fail-closed snapshot
//! (Shield on, no auto-approval).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::{PlanDefaults, PolicyConfig};
use crate::error::{ConfigError, PolicyError};
use crate::triage::types::Organization;

/// Lower bounds of the roasteable, corrective and critical bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub roast_lower: f64,
    pub corrective: f64,
    pub critical: f64,
}

impl Thresholds {
    /// Bands must be ordered within `[0, 1]`.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let ordered = 0.0 <= self.roast_lower
            && self.roast_lower <= self.corrective
            && self.corrective <= self.critical
            && self.critical <= 1.0;
        if ordered {
            Ok(())
        } else {
            Err(PolicyError::InvalidThresholds(format!(
                "expected 0 <= {} <= {} <= {} <= 1",
                self.roast_lower, self.corrective, self.critical
            )))
        }
    }
}

/// Where a snapshot's values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Plan,
    Override,
    FailClosed,
}

impl PolicySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Override => "override",
            Self::FailClosed => "fail_closed",
        }
    }
}

/// Policy values frozen for one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub plan_name: String,
    pub thresholds: Thresholds,
    pub auto_approve: bool,
    pub shield_enabled: bool,
    pub source: PolicySource,
    /// Content hash of the values above.
    pub version: String,
}

impl PolicySnapshot {
    fn new(
        plan_name: &str,
        thresholds: Thresholds,
        auto_approve: bool,
        shield_enabled: bool,
        source: PolicySource,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(plan_name.as_bytes());
        for value in [thresholds.roast_lower, thresholds.corrective, thresholds.critical] {
            hasher.update(&value.to_le_bytes());
        }
        hasher.update(&[auto_approve as u8, shield_enabled as u8]);
        let version = hasher.finalize().to_hex()[..16].to_string();

        Self {
            plan_name: plan_name.to_string(),
            thresholds,
            auto_approve,
            shield_enabled,
            source,
            version,
        }
    }
}

/// Per-organization overrides. Unset fields inherit the plan defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationPolicy {
    /// Replaces the plan's roast lower bound.
    pub toxicity_threshold: Option<f64>,
    pub auto_approve: Option<bool>,
    pub shield_enabled: Option<bool>,
}

/// Source of organization overrides.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn organization_policy(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationPolicy>, PolicyError>;
}

/// In-memory override table.
#[derive(Debug, Default)]
pub struct OrganizationPolicies {
    entries: RwLock<HashMap<String, OrganizationPolicy>>,
}

impl OrganizationPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from a JSON object keyed by organization id.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "TRIAGE_POLICY_FILE".into(),
            message,
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
        let entries: HashMap<String, OrganizationPolicy> =
            serde_json::from_str(&raw).map_err(|e| invalid(format!("{}: {e}", path.display())))?;
        for (organization_id, policy) in &entries {
            if let Some(threshold) = policy
                .toxicity_threshold
                .filter(|t| !(0.0..=1.0).contains(t))
            {
                return Err(invalid(format!(
                    "toxicity_threshold {threshold} for {organization_id} is outside [0, 1]"
                )));
            }
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub async fn set(&self, organization_id: &str, policy: OrganizationPolicy) {
        self.entries
            .write()
            .await
            .insert(organization_id.to_string(), policy);
    }

    pub async fn remove(&self, organization_id: &str) -> Option<OrganizationPolicy> {
        self.entries.write().await.remove(organization_id)
    }
}

#[async_trait]
impl PolicyStore for OrganizationPolicies {
    async fn organization_policy(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationPolicy>, PolicyError> {
        Ok(self.entries.read().await.get(organization_id).cloned())
    }
}

/// Resolves organizations to policy snapshots.
pub struct PlanPolicy {
    config: PolicyConfig,
    store: Option<Arc<dyn PolicyStore>>,
}

impl PlanPolicy {
    /// Plan table only, no organization overrides.
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    pub fn with_store(config: PolicyConfig, store: Arc<dyn PolicyStore>) -> Self {
        Self {
            config,
            store: Some(store),
        }
    }

    /// Resolve the snapshot for one organization. Never fails.
    pub async fn resolve(&self, organization: &Organization) -> PolicySnapshot {
        let Some(plan) = self.plan(&organization.plan) else {
            let err = PolicyError::UnknownPlan {
                plan: organization.plan.clone(),
            };
            warn!(organization_id = %organization.id, error = %err, "Failing closed");
            return self.fail_closed(&organization.plan, None);
        };

        let overrides = match &self.store {
            Some(store) => match store.organization_policy(&organization.id).await {
                Ok(o) => o,
                Err(e) => {
                    warn!(organization_id = %organization.id, error = %e, "Policy lookup failed, failing closed");
                    return self.fail_closed(&plan.name, Some(plan));
                }
            },
            None => None,
        };

        let mut thresholds = self.plan_thresholds(plan);
        let Some(overrides) = overrides else {
            return PolicySnapshot::new(
                &plan.name,
                thresholds,
                plan.auto_approve,
                plan.shield_enabled,
                PolicySource::Plan,
            );
        };

        if let Some(threshold) = overrides.toxicity_threshold {
            thresholds.roast_lower = threshold;
        }
        if let Err(e) = thresholds.validate() {
            warn!(organization_id = %organization.id, error = %e, "Override rejected, failing closed");
            return self.fail_closed(&plan.name, Some(plan));
        }

        PolicySnapshot::new(
            &plan.name,
            thresholds,
            overrides.auto_approve.unwrap_or(plan.auto_approve),
            overrides.shield_enabled.unwrap_or(plan.shield_enabled),
            PolicySource::Override,
        )
    }

    fn plan(&self, name: &str) -> Option<&PlanDefaults> {
        self.config
            .plans
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    fn plan_thresholds(&self, plan: &PlanDefaults) -> Thresholds {
        Thresholds {
            roast_lower: plan.roast_threshold,
            corrective: self.config.corrective_threshold,
            critical: self.config.critical_threshold,
        }
    }

    /// Conservative snapshot: Shield on, manual approval.
    fn fail_closed(&self, plan_name: &str, plan: Option<&PlanDefaults>) -> PolicySnapshot {
        let thresholds = match plan.or_else(|| self.config.plans.first()) {
            Some(p) => self.plan_thresholds(p),
            None => Thresholds {
                roast_lower: self.config.corrective_threshold,
                corrective: self.config.corrective_threshold,
                critical: self.config.critical_threshold,
            },
        };
        PolicySnapshot::new(plan_name, thresholds, false, true, PolicySource::FailClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(plan: &str) -> Organization {
        Organization {
            id: "org-1".into(),
            plan: plan.into(),
        }
    }

    struct FailingStore;

    #[async_trait]
    impl PolicyStore for FailingStore {
        async fn organization_policy(
            &self,
            organization_id: &str,
        ) -> Result<Option<OrganizationPolicy>, PolicyError> {
            Err(PolicyError::Lookup {
                organization_id: organization_id.into(),
                reason: "connection refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn overrides_load_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        tokio::fs::write(
            &path,
            r#"{"org-1": {"auto_approve": true}, "org-2": {"toxicity_threshold": 0.4}}"#,
        )
        .await
        .unwrap();

        let overrides = Arc::new(OrganizationPolicies::load(&path).await.unwrap());
        let policy = PlanPolicy::with_store(PolicyConfig::default(), overrides);

        let snap = policy.resolve(&org("pro")).await;
        assert_eq!(snap.source, PolicySource::Override);
        assert!(snap.auto_approve);

        let other = Organization {
            id: "org-2".into(),
            plan: "pro".into(),
        };
        let snap = policy.resolve(&other).await;
        assert_eq!(snap.source, PolicySource::Override);
        assert_eq!(snap.thresholds.roast_lower, 0.4);
    }

    #[tokio::test]
    async fn malformed_policy_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        tokio::fs::write(&path, r#"{"org-1": {"toxicity_threshold": 1.5}}"#)
            .await
            .unwrap();
        assert!(OrganizationPolicies::load(&path).await.is_err());

        tokio::fs::write(&path, "[1, 2]").await.unwrap();
        assert!(OrganizationPolicies::load(&path).await.is_err());
        assert!(OrganizationPolicies::load(&dir.path().join("missing.json")).await.is_err());
    }

    #[tokio::test]
    async fn resolves_plan_defaults() {
        let policy = PlanPolicy::new(PolicyConfig::default());
        let pro = policy.resolve(&org("pro")).await;
        assert_eq!(pro.source, PolicySource::Plan);
        assert_eq!(pro.thresholds.roast_lower, 0.25);
        assert!(pro.shield_enabled);
        assert!(!pro.auto_approve);

        let free = policy.resolve(&org("free")).await;
        assert!(!free.shield_enabled);
        assert_eq!(free.thresholds.roast_lower, 0.30);
    }

    #[tokio::test]
    async fn unknown_plan_fails_closed() {
        let policy = PlanPolicy::new(PolicyConfig::default());
        let snap = policy.resolve(&org("enterprise-legacy")).await;
        assert_eq!(snap.source, PolicySource::FailClosed);
        assert!(snap.shield_enabled);
        assert!(!snap.auto_approve);
    }

    #[tokio::test]
    async fn lookup_error_fails_closed() {
        let policy = PlanPolicy::with_store(PolicyConfig::default(), Arc::new(FailingStore));
        let snap = policy.resolve(&org("free")).await;
        assert_eq!(snap.source, PolicySource::FailClosed);
        // free has no Shield, but a failed lookup must not leave it open
        assert!(snap.shield_enabled);
        assert!(!snap.auto_approve);
    }

    #[tokio::test]
    async fn overrides_apply_and_change_version() {
        let store = Arc::new(OrganizationPolicies::new());
        let policy = PlanPolicy::with_store(PolicyConfig::default(), store.clone());
        let before = policy.resolve(&org("pro")).await;

        store
            .set(
                "org-1",
                OrganizationPolicy {
                    toxicity_threshold: Some(0.4),
                    auto_approve: Some(true),
                    shield_enabled: None,
                },
            )
            .await;
        let after = policy.resolve(&org("pro")).await;

        assert_eq!(after.source, PolicySource::Override);
        assert_eq!(after.thresholds.roast_lower, 0.4);
        assert!(after.auto_approve);
        assert!(after.shield_enabled);
        assert_ne!(before.version, after.version);
    }

    #[tokio::test]
    async fn inconsistent_override_fails_closed() {
        let store = Arc::new(OrganizationPolicies::new());
        store
            .set(
                "org-1",
                OrganizationPolicy {
                    toxicity_threshold: Some(0.95),
                    auto_approve: Some(true),
                    shield_enabled: Some(false),
                },
            )
            .await;
        let policy = PlanPolicy::with_store(PolicyConfig::default(), store);
        let snap = policy.resolve(&org("pro")).await;
        assert_eq!(snap.source, PolicySource::FailClosed);
        assert!(!snap.auto_approve);
        assert!(snap.shield_enabled);
    }

    #[tokio::test]
    async fn snapshot_is_stable_for_same_inputs() {
        let policy = PlanPolicy::new(PolicyConfig::default());
        let a = policy.resolve(&org("plus")).await;
        let b = policy.resolve(&org("PLUS")).await;
        assert_eq!(a.version, b.version);
    }

    #[test]
    fn thresholds_validate_ordering() {
        let ok = Thresholds {
            roast_lower: 0.3,
            corrective: 0.7,
            critical: 0.85,
        };
        assert!(ok.validate().is_ok());
        let bad = Thresholds {
            roast_lower: 0.8,
            ..ok
        };
        assert!(bad.validate().is_err());
    }
}
