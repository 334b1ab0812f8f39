//! Plan definitions and the immutable plan registry.
//!
//! Plans are assembled once at boot, either with builders or from JSON via
//! [`PlanRegistry::from_json_str`], and then shared read-only as an
//! `Arc<PlanRegistry>`. Any invalid limit or plan fails the build with a
//! [`ConfigError`](crate::error::ConfigError); nothing is coerced at runtime.

pub mod config_file;
pub mod limit;
pub mod registry;

pub use limit::{
    AfterLimit, Cap, CountScope, LimitSpec, LimitSpecBuilder, DEFAULT_GRACE_DAYS, DEFAULT_WARN_AT,
    MAX_DURATION_DAYS,
};
pub use registry::{PlanRegistry, PlanRegistryBuilder};

use crate::error::ConfigError;
use std::collections::{BTreeMap, BTreeSet};

/// A pricing plan: boolean features plus keyed limits.
#[derive(Debug, Clone)]
pub struct Plan {
    key: String,
    name: String,
    description: Option<String>,
    features: BTreeSet<String>,
    limits: BTreeMap<String, LimitSpec>,
}

impl Plan {
    pub fn builder(key: impl Into<String>) -> PlanBuilder {
        PlanBuilder::new(key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(String::as_str)
    }

    pub fn limit(&self, key: &str) -> Option<&LimitSpec> {
        self.limits.get(key)
    }

    /// Limits in key order.
    pub fn limits(&self) -> impl Iterator<Item = &LimitSpec> {
        self.limits.values()
    }
}

/// Builder for [`Plan`].
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    key: String,
    name: Option<String>,
    description: Option<String>,
    features: BTreeSet<String>,
    limits: Vec<LimitSpec>,
}

impl PlanBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            description: None,
            features: BTreeSet::new(),
            limits: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    pub fn limit(mut self, spec: LimitSpec) -> Self {
        self.limits.push(spec);
        self
    }

    pub fn build(self) -> Result<Plan, ConfigError> {
        let mut limits = BTreeMap::new();
        for spec in self.limits {
            let limit_key = spec.key().to_string();
            if limits.insert(limit_key.clone(), spec).is_some() {
                return Err(ConfigError::DuplicateLimit { plan: self.key, limit: limit_key });
            }
        }
        Ok(Plan {
            name: self.name.unwrap_or_else(|| self.key.clone()),
            key: self.key,
            description: self.description,
            features: self.features,
            limits,
        })
    }
}
