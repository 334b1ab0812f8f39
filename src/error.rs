//! Error types for plan enforcement.
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Unified error type returned by the enforcement core.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Invalid plan or limit configuration. Fatal at boot.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// A computed or custom period produced an empty or inverted window.
    #[error("invalid window: end {end} is not after start {start}")]
    InvalidWindow { start: DateTime<Utc>, end: DateTime<Utc> },
    /// A custom period function omitted one of its bounds.
    #[error("invalid window: custom period returned no {bound} bound")]
    MissingWindowBound { bound: &'static str },
    /// Storage failure; see [`StoreError::is_transient`].
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// A plan assignment points at a plan the registry does not know.
    #[error("unknown plan '{plan}'")]
    UnknownPlan { plan: String },
    /// The resolved plan does not include the requested feature.
    #[error("feature '{feature}' is not included in plan '{plan}'")]
    FeatureNotEntitled { plan: String, feature: String },
}

impl WardenError {
    /// True when retrying the whole call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_transient())
    }

    /// Check if this error is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this error came from window derivation
    pub fn is_invalid_window(&self) -> bool {
        matches!(self, Self::InvalidWindow { .. } | Self::MissingWindowBound { .. })
    }

    /// Borrow the storage error if present.
    pub fn as_storage(&self) -> Option<&StoreError> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

/// Boot-time configuration failures. Never coerced into defaults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("limit '{limit}': grace period requires a blocking after_limit mode, not just_warn")]
    GraceWithJustWarn { limit: String },
    #[error("limit '{limit}': grace period must be > 0")]
    ZeroGrace { limit: String },
    #[error("limit '{limit}': cap must be > 0 or unlimited")]
    ZeroCap { limit: String },
    #[error("limit '{limit}': warning threshold {threshold} must be in (0, 1]")]
    InvalidThreshold { limit: String, threshold: String },
    #[error("limit '{limit}': count scope is only valid on persistent caps")]
    ScopeOnPeriodLimit { limit: String },
    #[error("limit '{limit}': grace period must be at most {max_days} days")]
    GraceOutOfRange { limit: String, max_days: i64 },
    #[error("limit '{limit}': period duration must be > 0")]
    ZeroPeriod { limit: String },
    #[error("limit '{limit}': period duration must be between one day and {max_days} days")]
    PeriodOutOfRange { limit: String, max_days: i64 },
    #[error("limit '{limit}': cap '{value}' is neither an integer nor \"unlimited\"")]
    InvalidCap { limit: String, value: String },
    #[error("plan '{plan}' defines limit '{limit}' twice")]
    DuplicateLimit { plan: String, limit: String },
    #[error("plan '{plan}' is registered twice")]
    DuplicatePlan { plan: String },
    #[error("default plan '{plan}' is not registered")]
    UnknownDefaultPlan { plan: String },
    #[error("no default plan configured")]
    MissingDefaultPlan,
    #[error("persistent limit '{limit}' has no live-count source")]
    MissingLiveCount { limit: String },
    #[error("counter upsert retry needs at least one attempt")]
    ZeroRetryAttempts,
    #[error("malformed plan configuration: {0}")]
    Parse(String),
}

/// Failures raised by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Row lock could not be acquired within the configured wait.
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    LockTimeout { key: String, waited: Duration },
    /// A unique-key insert lost a race against another writer.
    #[error("row {key} already exists")]
    Conflict { key: String },
    /// The bounded counter-upsert retry budget ran out.
    #[error("counter upsert for {key} failed after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: usize },
    /// Backend-specific failure.
    #[error("storage backend error: {message}")]
    Backend { message: String, transient: bool },
}

impl StoreError {
    /// Construct a backend error that callers may retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into(), transient: true }
    }

    /// Construct a backend error that will not go away on retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into(), transient: false }
    }

    /// Lock timeouts, exhausted retries and transient backend errors are retryable.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::RetriesExhausted { .. } => true,
            Self::Backend { transient, .. } => *transient,
            Self::Conflict { .. } => false,
        }
    }

    /// Check if this error is a uniqueness violation
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn invalid_window_display() {
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let err = WardenError::InvalidWindow { start, end };
        let msg = err.to_string();
        assert!(msg.contains("invalid window"));
        assert!(msg.contains("2025-01-01"));
        assert!(err.is_invalid_window());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classification() {
        let timeout = StoreError::LockTimeout { key: "b:l".into(), waited: Duration::from_secs(1) };
        assert!(timeout.is_transient());
        assert!(WardenError::from(timeout).is_transient());

        let exhausted = StoreError::RetriesExhausted { key: "k".into(), attempts: 3 };
        assert!(exhausted.is_transient());

        assert!(!StoreError::Conflict { key: "k".into() }.is_transient());
        assert!(StoreError::Conflict { key: "k".into() }.is_conflict());
        assert!(StoreError::transient("deadlock").is_transient());
        assert!(!StoreError::permanent("disk full").is_transient());
    }

    #[test]
    fn config_error_wraps() {
        let err: WardenError = ConfigError::MissingDefaultPlan.into();
        assert!(err.is_config());
        assert!(err.as_storage().is_none());
        assert_eq!(err.to_string(), "configuration error: no default plan configured");
    }
}
