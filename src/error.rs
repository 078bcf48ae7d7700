//! Error types for the triage core.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("Missing capability: {capability}")]
    Forbidden { capability: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// What the caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Bad input; retrying the same request will fail again.
    RejectedInvalid,
    /// A dependency is unavailable; retry later.
    RetryLater { retry_after: Option<Duration> },
    /// Caller lacks a capability.
    Forbidden,
    /// Anything else.
    Internal,
}

impl Error {
    /// Map to the user-visible outcome.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Validation(_) => Outcome::RejectedInvalid,
            Self::Provider(e) => Outcome::RetryLater {
                retry_after: e.retry_after(),
            },
            Self::Database(DatabaseError::Busy(_)) => Outcome::RetryLater {
                retry_after: Some(Duration::from_secs(1)),
            },
            Self::Forbidden { .. } => Outcome::Forbidden,
            _ => Outcome::Internal,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::Provider(e) => e.code(),
            Self::Forbidden { .. } => "INSUFFICIENT_PERMISSIONS",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Database(_) => "STORAGE_ERROR",
            Self::Policy(_) => "POLICY_ERROR",
            Self::Concurrency(_) => "CONCURRENCY_ERROR",
            Self::Internal(_) => "ANALYSIS_FAILED",
        }
    }

    /// Whether the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.outcome(), Outcome::RetryLater { .. })
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Another connection holds the write lock.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Input rejected before any scoring happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required and must be non-empty text")]
    InvalidContent { field: String },

    #[error("{field} exceeds maximum length ({length} > {max} characters)")]
    ContentTooLong {
        field: String,
        length: usize,
        max: usize,
    },

    #[error("At least one comment is required")]
    EmptyBatch,

    #[error("Maximum {max} comments per batch request, got {size}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Invalid time_range '{value}', expected one of 1h, 24h, 7d, 30d")]
    InvalidTimeRange { value: String },

    #[error("{field} is required")]
    MissingField { field: String },

    #[error("{field} differs from the text already analyzed under this comment id")]
    ContentMismatch { field: String },

    #[error("No shield action {id} in this organization")]
    UnknownShieldAction { id: String },

    #[error("{reason}")]
    InvalidShieldStatus { reason: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidContent { .. } => "INVALID_CONTENT",
            Self::ContentTooLong { .. } => "CONTENT_TOO_LONG",
            Self::EmptyBatch => "EMPTY_COMMENTS_ARRAY",
            Self::BatchTooLarge { .. } => "BATCH_SIZE_EXCEEDED",
            Self::InvalidTimeRange { .. } => "INVALID_TIME_RANGE",
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::ContentMismatch { .. } => "CONTENT_MISMATCH",
            Self::UnknownShieldAction { .. } => "SHIELD_ACTION_NOT_FOUND",
            Self::InvalidShieldStatus { .. } => "INVALID_SHIELD_STATUS",
        }
    }

    /// The offending input field.
    pub fn field(&self) -> &str {
        match self {
            Self::InvalidContent { field }
            | Self::ContentTooLong { field, .. }
            | Self::MissingField { field }
            | Self::ContentMismatch { field } => field,
            Self::EmptyBatch | Self::BatchTooLarge { .. } => "comments",
            Self::InvalidTimeRange { .. } => "time_range",
            Self::UnknownShieldAction { .. } => "action_id",
            Self::InvalidShieldStatus { .. } => "status",
        }
    }
}

/// Toxicity scoring failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Caller deadline exceeded while scoring")]
    DeadlineExceeded,

    #[error("Provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } | Self::DeadlineExceeded => "PROVIDER_TIMEOUT",
            Self::RateLimited { .. } => "PROVIDER_RATE_LIMITED",
            _ => "PROVIDER_UNAVAILABLE",
        }
    }

    /// Transient failures worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable { .. } | Self::RateLimited { .. }
        )
    }

    /// Hint for callers of the boundary service.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => retry_after.or(Some(Duration::from_secs(30))),
            _ => Some(Duration::from_secs(5)),
        }
    }
}

/// Threshold lookup failures. Never propagated to callers: policy resolution
/// falls back to conservative defaults instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("Policy lookup failed for organization {organization_id}: {reason}")]
    Lookup {
        organization_id: String,
        reason: String,
    },

    #[error("Unknown plan '{plan}'")]
    UnknownPlan { plan: String },

    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),
}

/// Lost races on shared counters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("Strike counter for {organization_id}/{author_id} kept changing after {attempts} attempts")]
    StrikeConflict {
        organization_id: String,
        author_id: String,
        attempts: u32,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
