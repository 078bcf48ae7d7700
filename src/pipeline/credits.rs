//! Credit accounting for analyzed comments.
//!
//! Usage is counted per organization and calendar month. `can_consume` is
//! checked before a comment is scored; `deduct` charges it afterwards.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::error::Error;
use crate::triage::types::Organization;

/// Proof that a comment was charged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub organization_id: String,
    pub comment_id: String,
    pub units: u32,
    /// Organization usage this month after this charge.
    pub used_total: u64,
    pub charged_at: DateTime<Utc>,
}

/// Answer of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub used: u64,
    /// `None` when the plan is unlimited.
    pub limit: Option<u64>,
}

/// Billing backend. Callers wrap `deduct` in `IdempotencyGuard::guard_once`.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Whether `units` more fit in the organization's monthly quota.
    async fn can_consume(&self, organization: &Organization, units: u32) -> Result<QuotaCheck, Error>;

    async fn deduct(
        &self,
        organization_id: &str,
        comment_id: &str,
        units: u32,
    ) -> Result<CreditReceipt, Error>;

    /// Usage in the current month.
    async fn used(&self, organization_id: &str) -> u64;
}

type Period = (i32, u32);

fn current_period() -> Period {
    let now = Utc::now();
    (now.year(), now.month())
}

/// Usage counters kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    usage: RwLock<HashMap<String, (Period, u64)>>,
    /// Plan table for limits; without one every plan is unlimited.
    plans: Option<PolicyConfig>,
}

impl InMemoryCreditLedger {
    /// Ledger without limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger enforcing each plan's `monthly_analysis_limit`.
    pub fn with_plan_limits(plans: PolicyConfig) -> Self {
        Self {
            usage: RwLock::default(),
            plans: Some(plans),
        }
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn can_consume(&self, organization: &Organization, units: u32) -> Result<QuotaCheck, Error> {
        let used = self.used(&organization.id).await;
        let limit = self
            .plans
            .as_ref()
            .and_then(|plans| plans.monthly_limit(&organization.plan));
        let allowed = limit.is_none_or(|limit| used + u64::from(units) <= limit);
        Ok(QuotaCheck {
            allowed,
            used,
            limit,
        })
    }

    async fn deduct(
        &self,
        organization_id: &str,
        comment_id: &str,
        units: u32,
    ) -> Result<CreditReceipt, Error> {
        let period = current_period();
        let mut usage = self.usage.write().await;
        let entry = usage
            .entry(organization_id.to_string())
            .or_insert((period, 0));
        if entry.0 != period {
            *entry = (period, 0);
        }
        entry.1 += u64::from(units);
        let used_total = entry.1;
        debug!(organization_id, comment_id, units, used_total, "Credits deducted");

        Ok(CreditReceipt {
            organization_id: organization_id.to_string(),
            comment_id: comment_id.to_string(),
            units,
            used_total,
            charged_at: Utc::now(),
        })
    }

    async fn used(&self, organization_id: &str) -> u64 {
        match self.usage.read().await.get(organization_id) {
            Some((period, used)) if *period == current_period() => *used,
            _ => 0,
        }
    }
}
