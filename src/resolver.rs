//! Which plan applies to a billable.
//!
//! Resolution order: a manual assignment, then the plan derived from an active
//! subscription, then the registry's default plan.

use crate::billable::Billable;
use crate::error::WardenError;
use crate::plan::{Plan, PlanRegistry};
use crate::store::AssignmentStore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Where a resolved plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Assignment,
    Subscription,
    Default,
}

impl fmt::Display for PlanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanSource::Assignment => write!(f, "assignment"),
            PlanSource::Subscription => write!(f, "subscription"),
            PlanSource::Default => write!(f, "default"),
        }
    }
}

/// A plan together with the rule that selected it.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedPlan<'a> {
    pub plan: &'a Plan,
    pub source: PlanSource,
}

#[derive(Debug, Clone)]
pub struct PlanResolver<A> {
    registry: Arc<PlanRegistry>,
    assignments: A,
}

impl<A> PlanResolver<A>
where
    A: AssignmentStore,
{
    pub fn new(registry: Arc<PlanRegistry>, assignments: A) -> Self {
        Self { registry, assignments }
    }

    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }

    pub fn assignments(&self) -> &A {
        &self.assignments
    }

    /// Resolve the effective plan for `billable`.
    ///
    /// A manual assignment naming an unregistered plan is an error. A
    /// subscription naming one is logged and skipped.
    pub async fn resolve(&self, billable: &Billable) -> Result<ResolvedPlan<'_>, WardenError> {
        if let Some(assignment) = self.assignments.get(billable.id()).await? {
            let plan = self
                .registry
                .plan(&assignment.plan)
                .ok_or_else(|| WardenError::UnknownPlan { plan: assignment.plan.clone() })?;
            return Ok(ResolvedPlan { plan, source: PlanSource::Assignment });
        }

        if let Some(key) = billable.subscribed_plan() {
            match self.registry.plan(key) {
                Some(plan) => return Ok(ResolvedPlan { plan, source: PlanSource::Subscription }),
                None => tracing::warn!(
                    billable = %billable.id(),
                    plan = key,
                    "subscription names an unregistered plan; using default"
                ),
            }
        }

        Ok(ResolvedPlan { plan: self.registry.default_plan(), source: PlanSource::Default })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AssignmentSource, InMemoryAssignmentStore, PlanAssignment};
    use chrono::Utc;

    fn registry() -> Arc<PlanRegistry> {
        Arc::new(
            PlanRegistry::builder()
                .plan(Plan::builder("free").build().unwrap())
                .plan(Plan::builder("pro").build().unwrap())
                .plan(Plan::builder("enterprise").build().unwrap())
                .default_plan("free")
                .build()
                .unwrap(),
        )
    }

    fn assign(plan: &str) -> PlanAssignment {
        PlanAssignment {
            billable: "org_1".into(),
            plan: plan.into(),
            source: AssignmentSource::Admin,
            assigned_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn assignment_beats_subscription_beats_default() {
        let store = InMemoryAssignmentStore::new();
        let resolver = PlanResolver::new(registry(), store.clone());
        let billable = Billable::new("org_1").with_subscribed_plan("pro");

        let resolved = resolver.resolve(&Billable::new("org_1")).await.unwrap();
        assert_eq!((resolved.plan.key(), resolved.source), ("free", PlanSource::Default));

        let resolved = resolver.resolve(&billable).await.unwrap();
        assert_eq!((resolved.plan.key(), resolved.source), ("pro", PlanSource::Subscription));

        store.put(assign("enterprise")).await.unwrap();
        let resolved = resolver.resolve(&billable).await.unwrap();
        assert_eq!((resolved.plan.key(), resolved.source), ("enterprise", PlanSource::Assignment));
    }

    #[tokio::test]
    async fn unknown_subscription_plan_falls_back_to_default() {
        let resolver = PlanResolver::new(registry(), InMemoryAssignmentStore::new());
        let billable = Billable::new("org_1").with_subscribed_plan("legacy_2019");
        let resolved = resolver.resolve(&billable).await.unwrap();
        assert_eq!(resolved.source, PlanSource::Default);
    }

    #[tokio::test]
    async fn unknown_assigned_plan_is_an_error() {
        let store = InMemoryAssignmentStore::new();
        store.put(assign("missing")).await.unwrap();
        let resolver = PlanResolver::new(registry(), store);
        let err = resolver.resolve(&Billable::new("org_1")).await.unwrap_err();
        assert!(matches!(err, WardenError::UnknownPlan { plan } if plan == "missing"));
    }
}
