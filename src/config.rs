//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct TriageConfig {
    pub policy: PolicyConfig,
    pub reincidence: ReincidenceConfig,
    pub cache: CacheConfig,
    pub scoring: ScoringConfig,
    pub shield: ShieldConfig,
    pub server: ServerConfig,
}

/// Toxicity bands shared by every plan plus the per-plan table.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Lower bound of the corrective band (upper bound of plain intermediate).
    pub corrective_threshold: f64,
    /// Lower bound of the critical band.
    pub critical_threshold: f64,
    pub plans: Vec<PlanDefaults>,
}

/// Per-plan defaults before organization overrides.
#[derive(Debug, Clone)]
pub struct PlanDefaults {
    pub name: String,
    /// Lower bound of the roasteable band.
    pub roast_threshold: f64,
    pub shield_enabled: bool,
    pub auto_approve: bool,
    /// Analyses per calendar month; `None` is unlimited.
    pub monthly_analysis_limit: Option<u64>,
}

impl PlanDefaults {
    fn new(name: &str, roast_threshold: f64, shield_enabled: bool, monthly_limit: u64) -> Self {
        Self {
            name: name.to_string(),
            roast_threshold,
            shield_enabled,
            auto_approve: false,
            monthly_analysis_limit: Some(monthly_limit),
        }
    }
}

impl PolicyConfig {
    /// Monthly analysis limit for a plan. Unknown plans get the smallest
    /// configured limit.
    pub fn monthly_limit(&self, plan: &str) -> Option<u64> {
        match self
            .plans
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(plan.trim()))
        {
            Some(known) => known.monthly_analysis_limit,
            None => self.plans.iter().filter_map(|p| p.monthly_analysis_limit).min(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            corrective_threshold: 0.70,
            critical_threshold: 0.85,
            plans: vec![
                PlanDefaults::new("free", 0.30, false, 100),
                PlanDefaults::new("starter", 0.30, true, 100),
                PlanDefaults::new("pro", 0.25, true, 1_000),
                PlanDefaults::new("plus", 0.20, true, 5_000),
                PlanDefaults::new("creator_plus", 0.20, true, 5_000),
            ],
        }
    }
}

/// Strike counts at which an author enters each offender state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReincidenceConfig {
    pub first_offense_strikes: u32,
    pub repeat_offender_strikes: u32,
    pub chronic_offender_strikes: u32,
}

impl Default for ReincidenceConfig {
    fn default() -> Self {
        Self {
            first_offense_strikes: 1,
            repeat_offender_strikes: 2,
            chronic_offender_strikes: 5,
        }
    }
}

/// Decision cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: u64,
    /// When set, fingerprints are keyed hashes so ids cannot be guessed.
    pub fingerprint_secret: Option<SecretString>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300), // 5 minutes
            max_entries: 1_000,
            fingerprint_secret: None,
        }
    }
}

/// Toxicity scoring settings.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Bound for a single provider attempt.
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Score with the pattern heuristic when the provider fails.
    pub fallback_on_error: bool,
    pub perspective_api_key: Option<SecretString>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(200),
            fallback_on_error: false,
            perspective_api_key: None,
        }
    }
}

/// Shield settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShieldConfig {
    /// Compute and log Shield actions without executing them.
    pub dry_run: bool,
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// JSON map of organization id to policy overrides.
    pub policy_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/triage.db"),
            policy_file: None,
        }
    }
}

impl TriageConfig {
    /// Build from `TRIAGE_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.policy.corrective_threshold =
            env_or("TRIAGE_CORRECTIVE_THRESHOLD", config.policy.corrective_threshold)?;
        config.policy.critical_threshold =
            env_or("TRIAGE_CRITICAL_THRESHOLD", config.policy.critical_threshold)?;

        config.reincidence.repeat_offender_strikes = env_or(
            "TRIAGE_REPEAT_OFFENDER_STRIKES",
            config.reincidence.repeat_offender_strikes,
        )?;
        config.reincidence.chronic_offender_strikes = env_or(
            "TRIAGE_CHRONIC_OFFENDER_STRIKES",
            config.reincidence.chronic_offender_strikes,
        )?;

        config.cache.ttl = Duration::from_secs(env_or("TRIAGE_CACHE_TTL_SECS", 300u64)?);
        config.cache.max_entries = env_or("TRIAGE_CACHE_MAX_ENTRIES", config.cache.max_entries)?;
        config.cache.fingerprint_secret = env_secret("TRIAGE_FINGERPRINT_SECRET");

        config.scoring.timeout =
            Duration::from_millis(env_or("TRIAGE_SCORE_TIMEOUT_MS", 5_000u64)?);
        config.scoring.max_retries =
            env_or("TRIAGE_SCORE_MAX_RETRIES", config.scoring.max_retries)?;
        config.scoring.retry_base_delay =
            Duration::from_millis(env_or("TRIAGE_SCORE_RETRY_BASE_MS", 200u64)?);
        config.scoring.fallback_on_error = env_or(
            "TRIAGE_FALLBACK_ON_PROVIDER_ERROR",
            config.scoring.fallback_on_error,
        )?;
        config.scoring.perspective_api_key = env_secret("PERSPECTIVE_API_KEY");

        config.shield.dry_run = env_or("TRIAGE_SHIELD_DRY_RUN", config.shield.dry_run)?;

        config.server.port = env_or("TRIAGE_PORT", config.server.port)?;
        if let Ok(path) = std::env::var("TRIAGE_DB_PATH") {
            config.server.db_path = PathBuf::from(path);
        }
        config.server.policy_file = std::env::var("TRIAGE_POLICY_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Reject threshold and strike settings that would make bands overlap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.policy;
        if !(0.0..=1.0).contains(&p.critical_threshold)
            || p.corrective_threshold > p.critical_threshold
        {
            return Err(ConfigError::InvalidThresholds(format!(
                "need corrective ({}) <= critical ({}) <= 1.0",
                p.corrective_threshold, p.critical_threshold
            )));
        }
        for plan in &p.plans {
            if plan.roast_threshold < 0.0 || plan.roast_threshold > p.corrective_threshold {
                return Err(ConfigError::InvalidThresholds(format!(
                    "plan {} roast threshold {} must be within [0, {}]",
                    plan.name, plan.roast_threshold, p.corrective_threshold
                )));
            }
        }

        let r = &self.reincidence;
        if r.first_offense_strikes == 0
            || r.first_offense_strikes >= r.repeat_offender_strikes
            || r.repeat_offender_strikes >= r.chronic_offender_strikes
        {
            return Err(ConfigError::InvalidValue {
                key: "reincidence".into(),
                message: format!(
                    "strike limits must increase strictly: {} < {} < {}",
                    r.first_offense_strikes, r.repeat_offender_strikes, r.chronic_offender_strikes
                ),
            });
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_CACHE_MAX_ENTRIES".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}
