//! Score classification.
//!
//! Pure function of a score and a threshold snapshot. Bands are half-open:
//! `[0, roast)` light, `[roast, corrective)` roasteable, `[corrective,
//! critical)` corrective, `[critical, 1]` critical.

use crate::error::ProviderError;
use crate::policy::Thresholds;
use crate::triage::types::Classification;

/// Classify a toxicity score against a threshold snapshot.
///
/// Rejects scores outside `[0, 1]` (including NaN) instead of guessing a band.
pub fn classify(
    score: f64,
    thresholds: &Thresholds,
    provider: &str,
) -> Result<Classification, ProviderError> {
    if !(0.0..=1.0).contains(&score) {
        return Err(ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("score {score} outside [0, 1]"),
        });
    }

    let class = if score >= thresholds.critical {
        Classification::critical()
    } else if score >= thresholds.corrective {
        Classification::corrective()
    } else if score >= thresholds.roast_lower {
        Classification::roasteable()
    } else {
        Classification::light()
    };
    Ok(class)
}
