//! Immutable registry of plans, built once at boot.

use super::Plan;
use crate::error::ConfigError;
use std::collections::BTreeMap;

/// Read-only set of plans plus the default plan key.
#[derive(Debug, Clone)]
pub struct PlanRegistry {
    plans: BTreeMap<String, Plan>,
    default_plan: String,
}

impl PlanRegistry {
    pub fn builder() -> PlanRegistryBuilder {
        PlanRegistryBuilder::default()
    }

    pub fn plan(&self, key: &str) -> Option<&Plan> {
        self.plans.get(key)
    }

    pub fn default_plan(&self) -> &Plan {
        // Presence is checked in `PlanRegistryBuilder::build`.
        &self.plans[&self.default_plan]
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }

    /// Keys of limits, across all plans, that are counted live rather than per period.
    pub fn persistent_limit_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .plans
            .values()
            .flat_map(|p| p.limits())
            .filter(|l| !l.is_per_period())
            .map(|l| l.key())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

/// Builder for [`PlanRegistry`].
#[derive(Debug, Default)]
pub struct PlanRegistryBuilder {
    plans: Vec<Plan>,
    default_plan: Option<String>,
}

impl PlanRegistryBuilder {
    pub fn plan(mut self, plan: Plan) -> Self {
        self.plans.push(plan);
        self
    }

    pub fn default_plan(mut self, key: impl Into<String>) -> Self {
        self.default_plan = Some(key.into());
        self
    }

    pub fn build(self) -> Result<PlanRegistry, ConfigError> {
        let mut plans = BTreeMap::new();
        for plan in self.plans {
            let key = plan.key().to_string();
            if plans.insert(key.clone(), plan).is_some() {
                return Err(ConfigError::DuplicatePlan { plan: key });
            }
        }
        let default_plan = self.default_plan.ok_or(ConfigError::MissingDefaultPlan)?;
        if !plans.contains_key(&default_plan) {
            return Err(ConfigError::UnknownDefaultPlan { plan: default_plan });
        }
        tracing::debug!(plans = plans.len(), default = %default_plan, "plan registry built");
        Ok(PlanRegistry { plans, default_plan })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodSpec;
    use crate::plan::LimitSpec;

    fn plan(key: &str) -> Plan {
        Plan::builder(key)
            .limit(LimitSpec::builder("projects").to(3).build().unwrap())
            .limit(LimitSpec::builder("exports").to(10).per(PeriodSpec::Month).build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn default_plan_must_exist() {
        let err = PlanRegistry::builder().plan(plan("free")).default_plan("pro").build().unwrap_err();
        assert_eq!(err, ConfigError::UnknownDefaultPlan { plan: "pro".into() });

        let err = PlanRegistry::builder().plan(plan("free")).build().unwrap_err();
        assert_eq!(err, ConfigError::MissingDefaultPlan);
    }

    #[test]
    fn duplicate_plans_fail() {
        let err = PlanRegistry::builder()
            .plan(plan("free"))
            .plan(plan("free"))
            .default_plan("free")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicatePlan { plan: "free".into() });
    }

    #[test]
    fn persistent_keys_skip_period_limits() {
        let registry = PlanRegistry::builder()
            .plan(plan("free"))
            .plan(plan("pro"))
            .default_plan("free")
            .build()
            .unwrap();
        assert_eq!(registry.persistent_limit_keys(), vec!["projects"]);
        assert_eq!(registry.default_plan().key(), "free");
    }
}
