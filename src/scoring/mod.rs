//! Toxicity scoring providers.
//!
//! A `ScoreProvider` turns text into a `ToxicityScore`. Providers may fail or
//! time out; callers wrap them in `RetryingProvider` and never treat a
//! failure as a zero score.

pub mod patterns;
pub mod perspective;
pub mod retry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub use patterns::PatternProvider;
pub use perspective::PerspectiveProvider;
pub use retry::RetryingProvider;

/// Score for one piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicityScore {
    /// Overall toxicity in `[0, 1]`.
    pub value: f64,
    /// Per-attribute scores, e.g. `INSULT`, `THREAT`.
    pub subscores: BTreeMap<String, f64>,
    /// Attributes considered present.
    pub categories: Vec<String>,
    /// Provider's confidence in `value`.
    pub confidence: f64,
    pub provider: String,
    pub computed_at: DateTime<Utc>,
}

/// A toxicity classifier.
#[async_trait]
pub trait ScoreProvider: Send + Sync {
    /// Stable provider name for logs and decisions.
    fn name(&self) -> &str;

    async fn score(&self, text: &str) -> Result<ToxicityScore, ProviderError>;
}
