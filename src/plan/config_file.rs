//! JSON plan configuration.
//!
//! ```json
//! {
//!   "default_plan": "free",
//!   "plans": {
//!     "free": {
//!       "name": "Free",
//!       "features": ["api_access"],
//!       "limits": {
//!         "projects": { "to": 3, "after_limit": "block_usage" },
//!         "exports": { "to": 100, "per": "month", "warn_at": [0.5, 0.9] },
//!         "reports": { "to": 5, "per": { "duration": { "seconds": 86400 } } }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Custom period functions cannot be expressed here; use the builders.

use super::{AfterLimit, LimitSpec, Plan, PlanRegistry, MAX_DURATION_DAYS};
use crate::error::ConfigError;
use crate::period::PeriodSpec;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegistry {
    default_plan: String,
    plans: BTreeMap<String, RawPlan>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    limits: BTreeMap<String, RawLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimit {
    to: RawCap,
    per: Option<RawPeriod>,
    after_limit: Option<AfterLimit>,
    grace_seconds: Option<i64>,
    warn_at: Option<Vec<f64>>,
    count_scope: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCap {
    Count(u64),
    Word(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawPeriod {
    Day,
    Week,
    Month,
    Year,
    BillingCycle,
    Duration { seconds: i64 },
}

impl RawPeriod {
    fn into_period(self, limit: &str) -> Result<PeriodSpec, ConfigError> {
        Ok(match self {
            RawPeriod::Day => PeriodSpec::Day,
            RawPeriod::Week => PeriodSpec::Week,
            RawPeriod::Month => PeriodSpec::Month,
            RawPeriod::Year => PeriodSpec::Year,
            RawPeriod::BillingCycle => PeriodSpec::BillingCycle,
            RawPeriod::Duration { seconds } => {
                let length = chrono::Duration::try_seconds(seconds).ok_or_else(|| {
                    let max_days = MAX_DURATION_DAYS;
                    ConfigError::PeriodOutOfRange { limit: limit.to_string(), max_days }
                })?;
                PeriodSpec::Duration(length)
            }
        })
    }
}

impl RawLimit {
    fn into_spec(self, key: String) -> Result<LimitSpec, ConfigError> {
        let mut builder = LimitSpec::builder(key.clone());
        builder = match self.to {
            RawCap::Count(n) => builder.to(n),
            RawCap::Word(word) if word == "unlimited" => builder.unlimited(),
            RawCap::Word(word) => return Err(ConfigError::InvalidCap { limit: key, value: word }),
        };
        if let Some(per) = self.per {
            builder = builder.per(per.into_period(&key)?);
        }
        if let Some(after_limit) = self.after_limit {
            builder = builder.after_limit(after_limit);
        }
        if let Some(seconds) = self.grace_seconds {
            let grace = chrono::Duration::try_seconds(seconds).ok_or_else(|| {
                ConfigError::GraceOutOfRange { limit: key.clone(), max_days: MAX_DURATION_DAYS }
            })?;
            builder = builder.grace(grace);
        }
        if let Some(warn_at) = self.warn_at {
            builder = builder.warn_at(warn_at);
        }
        if let Some(scope) = self.count_scope {
            builder = builder.count_scope(scope);
        }
        builder.build()
    }
}

impl PlanRegistry {
    /// Parse and validate a JSON plan configuration.
    pub fn from_json_str(json: &str) -> Result<PlanRegistry, ConfigError> {
        let raw: RawRegistry =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut builder = PlanRegistry::builder().default_plan(raw.default_plan);
        for (plan_key, raw_plan) in raw.plans {
            let mut plan = Plan::builder(plan_key);
            if let Some(name) = raw_plan.name {
                plan = plan.name(name);
            }
            if let Some(description) = raw_plan.description {
                plan = plan.description(description);
            }
            for feature in raw_plan.features {
                plan = plan.feature(feature);
            }
            for (limit_key, raw_limit) in raw_plan.limits {
                plan = plan.limit(raw_limit.into_spec(limit_key)?);
            }
            builder = builder.plan(plan.build()?);
        }
        builder.build()
    }
}
