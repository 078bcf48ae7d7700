//! Decision cache.
//!
//! Maps a fingerprint of (organization, comment, policy version) to a
//! previously computed `Decision`. Backed by moka with LRU eviction, a max
//! entry count and per-entry TTL. `clear()` is safe under concurrent
//! `get`/`put`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::CacheConfig;
use crate::triage::types::Decision;

const FINGERPRINT_CONTEXT: &str = "triage-shield 2026 decision-cache fingerprint";

/// Compute the cache key for a decision.
///
/// Keyed with a secret-derived key when one is configured, so fingerprints
/// cannot be recomputed from known ids.
pub fn fingerprint(
    organization_id: &str,
    comment_id: &str,
    policy_version: &str,
    secret: Option<&SecretString>,
) -> String {
    let input = format!("{organization_id}:{comment_id}:{policy_version}");
    match secret {
        Some(secret) => {
            let key = blake3::derive_key(FINGERPRINT_CONTEXT, secret.expose_secret().as_bytes());
            blake3::keyed_hash(&key, input.as_bytes()).to_hex().to_string()
        }
        None => blake3::hash(input.as_bytes()).to_hex().to_string(),
    }
}

#[derive(Clone)]
struct CachedDecision {
    decision: Decision,
    ttl: Duration,
}

struct DecisionExpiry;

impl Expiry<String, CachedDecision> for DecisionExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedDecision,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedDecision,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub hit_ratio: f64,
}

/// Bounded TTL cache of decisions.
pub struct DecisionCache {
    cache: Cache<String, CachedDecision>,
    default_ttl: Duration,
    secret: Option<SecretString>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DecisionCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(DecisionExpiry)
            .build();

        Self {
            cache,
            default_ttl: config.ttl,
            secret: config.fingerprint_secret.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fingerprint using this cache's key.
    pub fn fingerprint(&self, organization_id: &str, comment_id: &str, policy_version: &str) -> String {
        fingerprint(organization_id, comment_id, policy_version, self.secret.as_ref())
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, fingerprint: &str) -> Option<Decision> {
        match self.cache.get(fingerprint) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.decision)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, fingerprint: String, decision: Decision, ttl: Duration) {
        self.cache
            .insert(fingerprint, CachedDecision { decision, ttl });
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.cache.entry_count(),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triage::types::{DecisionAction, DecisionMetadata};
    use chrono::Utc;

    fn decision(comment_id: &str) -> Decision {
        Decision {
            action: DecisionAction::PublishNormal,
            reasoning: "low_toxicity".into(),
            comment_id: comment_id.into(),
            organization_id: "org-1".into(),
            toxicity_score: Some(0.1),
            categories: vec![],
            confidence: 0.9,
            classification: None,
            plan: "pro".into(),
            plan_threshold: 0.25,
            policy_version: "v1".into(),
            shield_decision: None,
            reincidence: None,
            strike_count: 0,
            fallback_used: false,
            correlation_id: "corr-1".into(),
            timestamp: Utc::now(),
            cache_hit: false,
            decision_time_ms: 3,
            metadata: DecisionMetadata::default(),
        }
    }

    fn cache(max_entries: u64) -> DecisionCache {
        DecisionCache::new(&CacheConfig {
            max_entries,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn get_after_put_returns_decision() {
        let cache = cache(10);
        let fp = cache.fingerprint("org-1", "c-1", "v1");
        cache.put(fp.clone(), decision("c-1"), Duration::from_secs(60));
        let hit = cache.get(&fp).unwrap();
        assert_eq!(hit.comment_id, "c-1");
        assert_eq!(hit.reasoning, "low_toxicity");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn miss_counts() {
        let cache = cache(10);
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_ratio, 0.0);
    }

    #[test]
    fn clear_turns_hits_into_misses() {
        let cache = cache(10);
        let fp = cache.fingerprint("org-1", "c-1", "v1");
        cache.put(fp.clone(), decision("c-1"), Duration::from_secs(60));
        cache.clear();
        assert!(cache.get(&fp).is_none());
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = cache(10);
        cache.put("fp".into(), decision("c-1"), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn size_is_bounded() {
        let cache = cache(5);
        for i in 0..50 {
            cache.put(format!("fp-{i}"), decision("c"), Duration::from_secs(60));
        }
        assert!(cache.stats().size <= 5);
    }

    #[test]
    fn fingerprint_separates_orgs_and_policy_versions() {
        let a = fingerprint("org-1", "c-1", "v1", None);
        assert_eq!(a, fingerprint("org-1", "c-1", "v1", None));
        assert_ne!(a, fingerprint("org-2", "c-1", "v1", None));
        assert_ne!(a, fingerprint("org-1", "c-1", "v2", None));
    }

    #[test]
    fn keyed_fingerprint_differs_from_plain() {
        let secret = SecretString::from("s3cret".to_string());
        let keyed = fingerprint("org-1", "c-1", "v1", Some(&secret));
        assert_ne!(keyed, fingerprint("org-1", "c-1", "v1", None));
        assert_eq!(keyed, fingerprint("org-1", "c-1", "v1", Some(&secret)));
    }
}
