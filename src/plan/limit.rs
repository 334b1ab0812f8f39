//! Limit specifications: caps, after-limit behavior, grace and warning thresholds.

use crate::error::ConfigError;
use crate::period::PeriodSpec;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Grace applied when a grace mode is configured without an explicit duration.
pub const DEFAULT_GRACE_DAYS: i64 = 7;

/// Longest accepted grace period or period length.
pub const MAX_DURATION_DAYS: i64 = 36_500;

/// Warning thresholds applied when none are configured.
pub const DEFAULT_WARN_AT: [f64; 3] = [0.6, 0.8, 0.95];

/// Maximum allowed usage for a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cap {
    Limited(u64),
    Unlimited,
}

impl Cap {
    /// True when `usage` is strictly above the cap.
    pub fn is_exceeded_by(&self, usage: u64) -> bool {
        match self {
            Cap::Limited(cap) => usage > *cap,
            Cap::Unlimited => false,
        }
    }

    /// Units left before the cap is reached; `None` for unlimited.
    pub fn remaining(&self, usage: u64) -> Option<u64> {
        match self {
            Cap::Limited(cap) => Some(cap.saturating_sub(usage)),
            Cap::Unlimited => None,
        }
    }

    /// Usage as a fraction of the cap; `None` for unlimited.
    pub fn fraction(&self, usage: u64) -> Option<f64> {
        match self {
            Cap::Limited(cap) if *cap > 0 => Some(usage as f64 / *cap as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cap::Limited(n) => write!(f, "{}", n),
            Cap::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// What happens once usage goes past the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterLimit {
    /// Allow, but report a warning.
    JustWarn,
    /// Block immediately.
    BlockUsage,
    /// Allow for the grace duration, then block.
    GraceThenBlock,
}

impl AfterLimit {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, AfterLimit::JustWarn)
    }
}

impl fmt::Display for AfterLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AfterLimit::JustWarn => write!(f, "just_warn"),
            AfterLimit::BlockUsage => write!(f, "block_usage"),
            AfterLimit::GraceThenBlock => write!(f, "grace_then_block"),
        }
    }
}

/// Opaque description of the filter a caller applies when live-counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountScope(String);

impl CountScope {
    pub fn new(description: impl Into<String>) -> Self {
        Self(description.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validated, immutable configuration of one limit.
#[derive(Debug, Clone)]
pub struct LimitSpec {
    key: String,
    cap: Cap,
    after_limit: AfterLimit,
    grace: Option<Duration>,
    warn_at: Vec<f64>,
    period: Option<PeriodSpec>,
    count_scope: Option<CountScope>,
}

impl LimitSpec {
    pub fn builder(key: impl Into<String>) -> LimitSpecBuilder {
        LimitSpecBuilder::new(key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cap(&self) -> Cap {
        self.cap
    }

    pub fn after_limit(&self) -> AfterLimit {
        self.after_limit
    }

    /// Grace duration; only meaningful for [`AfterLimit::GraceThenBlock`].
    pub fn grace(&self) -> Option<Duration> {
        self.grace
    }

    /// Ascending, de-duplicated warning fractions.
    pub fn warn_thresholds(&self) -> &[f64] {
        &self.warn_at
    }

    pub fn period(&self) -> Option<&PeriodSpec> {
        self.period.as_ref()
    }

    pub fn count_scope(&self) -> Option<&CountScope> {
        self.count_scope.as_ref()
    }

    /// Per-period allowance (counter rows) rather than a live-counted cap.
    pub fn is_per_period(&self) -> bool {
        self.period.is_some()
    }

    /// Highest configured threshold reached by `usage`.
    pub fn highest_crossed(&self, usage: u64) -> Option<f64> {
        let fraction = self.cap.fraction(usage)?;
        self.warn_at.iter().rev().copied().find(|t| fraction >= *t)
    }
}

/// Builder for [`LimitSpec`]; validation happens in [`LimitSpecBuilder::build`].
#[derive(Debug, Clone)]
pub struct LimitSpecBuilder {
    key: String,
    cap: Cap,
    after_limit: AfterLimit,
    grace: Option<Duration>,
    warn_at: Option<Vec<f64>>,
    period: Option<PeriodSpec>,
    count_scope: Option<CountScope>,
}

impl LimitSpecBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cap: Cap::Unlimited,
            after_limit: AfterLimit::GraceThenBlock,
            grace: None,
            warn_at: None,
            period: None,
            count_scope: None,
        }
    }

    /// Cap the limit at `n` units.
    pub fn to(mut self, n: u64) -> Self {
        self.cap = Cap::Limited(n);
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.cap = Cap::Unlimited;
        self
    }

    pub fn cap(mut self, cap: Cap) -> Self {
        self.cap = cap;
        self
    }

    pub fn after_limit(mut self, after_limit: AfterLimit) -> Self {
        self.after_limit = after_limit;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    pub fn warn_at(mut self, thresholds: impl IntoIterator<Item = f64>) -> Self {
        self.warn_at = Some(thresholds.into_iter().collect());
        self
    }

    /// Turn the limit into a per-period allowance.
    pub fn per(mut self, period: PeriodSpec) -> Self {
        self.period = Some(period);
        self
    }

    pub fn count_scope(mut self, scope: impl Into<String>) -> Self {
        self.count_scope = Some(CountScope::new(scope));
        self
    }

    pub fn build(self) -> Result<LimitSpec, ConfigError> {
        let key = self.key;
        if self.cap == Cap::Limited(0) {
            return Err(ConfigError::ZeroCap { limit: key });
        }

        let grace = match (self.grace, self.after_limit) {
            (Some(_), AfterLimit::JustWarn) => {
                return Err(ConfigError::GraceWithJustWarn { limit: key });
            }
            (Some(g), _) if g <= Duration::zero() => {
                return Err(ConfigError::ZeroGrace { limit: key });
            }
            (Some(g), _) if g > Duration::days(MAX_DURATION_DAYS) => {
                let max_days = MAX_DURATION_DAYS;
                return Err(ConfigError::GraceOutOfRange { limit: key, max_days });
            }
            (None, AfterLimit::GraceThenBlock) => Some(Duration::days(DEFAULT_GRACE_DAYS)),
            (grace, _) => grace,
        };

        let mut warn_at = self.warn_at.unwrap_or_else(|| DEFAULT_WARN_AT.to_vec());
        if let Some(bad) = warn_at.iter().find(|t| !(t.is_finite() && **t > 0.0 && **t <= 1.0)) {
            return Err(ConfigError::InvalidThreshold { limit: key, threshold: bad.to_string() });
        }
        warn_at.sort_by(f64::total_cmp);
        warn_at.dedup();

        if let Some(PeriodSpec::Duration(length)) = &self.period {
            if *length <= Duration::zero() {
                return Err(ConfigError::ZeroPeriod { limit: key });
            }
            if *length < Duration::days(1) || *length > Duration::days(MAX_DURATION_DAYS) {
                let max_days = MAX_DURATION_DAYS;
                return Err(ConfigError::PeriodOutOfRange { limit: key, max_days });
            }
        }
        if self.period.is_some() && self.count_scope.is_some() {
            return Err(ConfigError::ScopeOnPeriodLimit { limit: key });
        }

        Ok(LimitSpec {
            key,
            cap: self.cap,
            after_limit: self.after_limit,
            grace,
            warn_at,
            period: self.period,
            count_scope: self.count_scope,
        })
    }
}
