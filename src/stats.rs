//! Rolling decision log feeding the stats endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::ValidationError;
use crate::triage::types::{Decision, DecisionAction};

/// Entries older than this are pruned.
const RETENTION_DAYS: i64 = 30;
/// Hard cap on retained entries.
const MAX_ENTRIES: usize = 100_000;

/// Stats window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    pub fn duration(&self) -> Duration {
        match self {
            Self::LastHour => Duration::hours(1),
            Self::LastDay => Duration::hours(24),
            Self::LastWeek => Duration::days(7),
            Self::LastMonth => Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastHour => "1h",
            Self::LastDay => "24h",
            Self::LastWeek => "7d",
            Self::LastMonth => "30d",
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::LastDay
    }
}

impl FromStr for TimeRange {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::LastHour),
            "24h" => Ok(Self::LastDay),
            "7d" => Ok(Self::LastWeek),
            "30d" => Ok(Self::LastMonth),
            other => Err(ValidationError::InvalidTimeRange {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct LoggedDecision {
    at: DateTime<Utc>,
    organization_id: String,
    action: DecisionAction,
    toxicity_score: Option<f64>,
    decision_time_ms: u64,
    cache_hit: bool,
    fallback_used: bool,
    shield_action: bool,
}

/// Latency and quality figures for a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub average_decision_time_ms: f64,
    pub max_decision_time_ms: u64,
    pub average_toxicity: Option<f64>,
    pub cache_hit_rate: f64,
    pub fallback_rate: f64,
    pub shield_actions: u64,
}

/// Aggregated decisions for one organization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionStats {
    pub time_range: TimeRange,
    pub total_decisions: u64,
    pub decision_counts: BTreeMap<String, u64>,
    pub performance_metrics: PerformanceMetrics,
}

/// Bounded in-memory log of recent decisions.
pub struct DecisionLog {
    entries: RwLock<VecDeque<LoggedDecision>>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, decision: &Decision) {
        let entry = LoggedDecision {
            at: decision.timestamp,
            organization_id: decision.organization_id.clone(),
            action: decision.action,
            toxicity_score: decision.toxicity_score,
            decision_time_ms: decision.decision_time_ms,
            cache_hit: decision.cache_hit,
            fallback_used: decision.fallback_used,
            shield_action: decision.shield_decision.is_some(),
        };

        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        prune(&mut entries, Utc::now());
    }

    /// Aggregate one organization's decisions inside `range`.
    pub async fn summary(&self, organization_id: &str, range: TimeRange) -> DecisionStats {
        let since = Utc::now() - range.duration();
        let entries = self.entries.read().await;

        let mut decision_counts: BTreeMap<String, u64> = DecisionAction::ALL
            .iter()
            .map(|a| (a.label().to_string(), 0))
            .collect();
        let mut total = 0u64;
        let mut time_sum = 0u64;
        let mut max_time = 0u64;
        let mut toxicity_sum = 0.0;
        let mut toxicity_n = 0u64;
        let mut cache_hits = 0u64;
        let mut fallbacks = 0u64;
        let mut shield_actions = 0u64;

        for e in entries
            .iter()
            .filter(|e| e.organization_id == organization_id && e.at >= since)
        {
            total += 1;
            *decision_counts.entry(e.action.label().to_string()).or_default() += 1;
            time_sum += e.decision_time_ms;
            max_time = max_time.max(e.decision_time_ms);
            if let Some(score) = e.toxicity_score {
                toxicity_sum += score;
                toxicity_n += 1;
            }
            cache_hits += e.cache_hit as u64;
            fallbacks += e.fallback_used as u64;
            shield_actions += e.shield_action as u64;
        }

        let ratio = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        DecisionStats {
            time_range: range,
            total_decisions: total,
            decision_counts,
            performance_metrics: PerformanceMetrics {
                average_decision_time_ms: if total == 0 {
                    0.0
                } else {
                    time_sum as f64 / total as f64
                },
                max_decision_time_ms: max_time,
                average_toxicity: (toxicity_n > 0).then(|| toxicity_sum / toxicity_n as f64),
                cache_hit_rate: ratio(cache_hits),
                fallback_rate: ratio(fallbacks),
                shield_actions,
            },
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(entries: &mut VecDeque<LoggedDecision>, now: DateTime<Utc>) {
    let cutoff = now - Duration::days(RETENTION_DAYS);
    while entries
        .front()
        .is_some_and(|e| e.at < cutoff || entries.len() > MAX_ENTRIES)
    {
        entries.pop_front();
    }
}
