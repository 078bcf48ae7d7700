//! Perspective API scorer.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::ProviderError;
use crate::scoring::{ScoreProvider, ToxicityScore};

const DEFAULT_ENDPOINT: &str = "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze";

const ATTRIBUTES: &[&str] = &[
    "TOXICITY",
    "SEVERE_TOXICITY",
    "IDENTITY_ATTACK",
    "INSULT",
    "PROFANITY",
    "THREAT",
];

/// Attribute score above which the attribute is reported as a category.
const CATEGORY_THRESHOLD: f64 = 0.5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    #[serde(default)]
    attribute_scores: BTreeMap<String, AttributeScore>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeScore {
    summary_score: SummaryScore,
}

#[derive(Debug, Deserialize)]
struct SummaryScore {
    value: f64,
}

/// Google Perspective API client.
pub struct PerspectiveProvider {
    api_key: SecretString,
    endpoint: String,
    client: reqwest::Client,
}

impl PerspectiveProvider {
    pub fn new(api_key: SecretString) -> Self {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT)
    }

    /// Point at a different endpoint (tests, proxies).
    pub fn with_endpoint(api_key: SecretString, endpoint: impl Into<String>) -> Self {
        Self {
            api_key,
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request_failed(reason: impl Into<String>) -> ProviderError {
        ProviderError::RequestFailed {
            provider: "perspective".into(),
            reason: reason.into(),
        }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Convert a Perspective response into a score.
fn to_score(response: AnalyzeResponse) -> Result<ToxicityScore, ProviderError> {
    let subscores: BTreeMap<String, f64> = response
        .attribute_scores
        .into_iter()
        .map(|(name, attr)| (name, attr.summary_score.value))
        .collect();

    let toxicity = subscores
        .get("TOXICITY")
        .copied()
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: "perspective".into(),
            reason: "missing TOXICITY attribute".into(),
        })?;

    let categories = subscores
        .iter()
        .filter(|(_, v)| **v > CATEGORY_THRESHOLD)
        .map(|(k, _)| k.to_lowercase())
        .collect();

    Ok(ToxicityScore {
        value: (toxicity * 1000.0).round() / 1000.0,
        subscores,
        categories,
        confidence: 0.9,
        provider: "perspective".into(),
        computed_at: Utc::now(),
    })
}

#[async_trait]
impl ScoreProvider for PerspectiveProvider {
    fn name(&self) -> &str {
        "perspective"
    }

    async fn score(&self, text: &str) -> Result<ToxicityScore, ProviderError> {
        let requested: serde_json::Map<String, serde_json::Value> = ATTRIBUTES
            .iter()
            .map(|a| (a.to_string(), serde_json::json!({})))
            .collect();
        let body = serde_json::json!({
            "comment": { "text": text },
            "requestedAttributes": requested,
            "languages": ["en", "es"],
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::Unavailable {
                        provider: "perspective".into(),
                        reason: e.to_string(),
                    }
                } else {
                    Self::request_failed(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                provider: "perspective".into(),
                retry_after: parse_retry_after(resp.headers()),
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable {
                provider: "perspective".into(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Self::request_failed(format!("HTTP {status}: {detail}")));
        }

        let parsed: AnalyzeResponse = resp.json().await.map_err(|e| ProviderError::InvalidResponse {
            provider: "perspective".into(),
            reason: e.to_string(),
        })?;
        let score = to_score(parsed)?;
        debug!(value = score.value, categories = ?score.categories, "Perspective score received");
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: serde_json::Value) -> AnalyzeResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_scores_and_categories() {
        let score = to_score(response(serde_json::json!({
            "attributeScores": {
                "TOXICITY": {"summaryScore": {"value": 0.87654}},
                "INSULT": {"summaryScore": {"value": 0.71}},
                "THREAT": {"summaryScore": {"value": 0.1}}
            }
        })))
        .unwrap();
        assert_eq!(score.value, 0.877);
        assert_eq!(score.categories, vec!["insult".to_string(), "toxicity".to_string()]);
        assert_eq!(score.subscores.len(), 3);
    }

    #[test]
    fn missing_toxicity_is_invalid() {
        let err = to_score(response(serde_json::json!({
            "attributeScores": {"INSULT": {"summaryScore": {"value": 0.2}}}
        })))
        .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[test]
    fn retry_after_header_parsed() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(&reqwest::header::HeaderMap::new()), None);
    }
}
