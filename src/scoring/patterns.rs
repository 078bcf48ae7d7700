//! Regex heuristic scorer.
//!
//! Deterministic and offline. Each matching category contributes its weight;
//! the strongest weight is scaled down for very short comments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::warn;

use crate::error::ProviderError;
use crate::scoring::{ScoreProvider, ToxicityScore};

/// (category, pattern, weight)
const DEFAULT_RULES: &[(&str, &str, f64)] = &[
    ("insult", r"(?i)\b(idiot|stupid|dumb|moron)\b", 0.4),
    ("threat", r"(?i)\b(hate|kill|die|death)\b", 0.8),
    ("profanity", r"(?i)\b(fuck|shit|damn|ass)\b", 0.3),
    ("hate", r"(?i)\b(racist|nazi|hitler)\b", 0.9),
];

/// Word count at which the length scaling stops.
const FULL_WEIGHT_WORDS: f64 = 10.0;

struct CategoryRule {
    category: String,
    regex: Regex,
    weight: f64,
}

/// Pattern-based fallback scorer.
pub struct PatternProvider {
    rules: Vec<CategoryRule>,
}

impl PatternProvider {
    pub fn new() -> Self {
        let mut provider = Self { rules: Vec::new() };
        for (category, pattern, weight) in DEFAULT_RULES {
            if let Err(e) = provider.add_rule(category, pattern, *weight) {
                warn!(category, error = %e, "Skipping invalid scoring pattern");
            }
        }
        provider
    }

    pub fn add_rule(&mut self, category: &str, pattern: &str, weight: f64) -> Result<(), regex::Error> {
        self.rules.push(CategoryRule {
            category: category.to_string(),
            regex: Regex::new(pattern)?,
            weight: weight.clamp(0.0, 1.0),
        });
        Ok(())
    }

    /// Score synchronously.
    pub fn evaluate(&self, text: &str) -> ToxicityScore {
        let mut subscores = BTreeMap::new();
        let mut categories = Vec::new();
        let mut strongest: f64 = 0.0;

        for rule in &self.rules {
            if rule.regex.is_match(text) {
                subscores.insert(rule.category.clone(), rule.weight);
                categories.push(rule.category.clone());
                strongest = strongest.max(rule.weight);
            }
        }

        let words = text.split_whitespace().count() as f64;
        let scale = (words / FULL_WEIGHT_WORDS).min(1.0);
        let value = (strongest * scale * 1000.0).round() / 1000.0;

        ToxicityScore {
            value,
            subscores,
            categories,
            confidence: 0.5,
            provider: self.name().to_string(),
            computed_at: Utc::now(),
        }
    }
}

impl Default for PatternProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoreProvider for PatternProvider {
    fn name(&self) -> &str {
        "patterns"
    }

    async fn score(&self, text: &str) -> Result<ToxicityScore, ProviderError> {
        Ok(self.evaluate(text))
    }
}
