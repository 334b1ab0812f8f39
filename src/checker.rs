//! Decision façade.
//!
//! [`LimitChecker`] ties the pieces together for one call:
//!
//! 1. resolve the billable's plan and look up the limit,
//! 2. derive the window (per-period) or fetch the live count (persistent),
//! 3. run the [`GraceManager`] transition under the row lock,
//! 4. record the increment on [`commit`](LimitChecker::commit),
//! 5. dispatch events best-effort after the row is committed.
//!
//! The checker holds no mutable state of its own; every decision is derived from
//! storage and the clock, so it can be shared freely behind an `Arc`.

use crate::billable::{Billable, BillableId};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, WardenError};
use crate::grace::{GraceManager, Outcome, TransitionInput};
use crate::period::{self, Window};
use crate::plan::{Cap, LimitSpec, PlanRegistry};
use crate::resolver::PlanResolver;
use crate::retry::UpsertRetry;
use crate::store::{
    AssignmentSource, AssignmentStore, CounterStore, InMemoryAssignmentStore,
    InMemoryCounterStore, InMemoryStateStore, PlanAssignment, StateGuard, StateKey, StateStore,
};
use crate::telemetry::{emit_best_effort, EventSink, NullSink};
use crate::usage::{LiveCount, UsageAccounting};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Metadata key set when a blocked outcome was downgraded for a system call.
pub const SYSTEM_OVERRIDE_KEY: &str = "system_override";

/// Per-call options for [`LimitChecker::evaluate`] and [`LimitChecker::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOptions {
    /// Units the action would consume.
    pub by: u64,
    /// Never return `blocked`; state and events are unaffected.
    pub allow_system_override: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self { by: 1, allow_system_override: false }
    }
}

impl CheckOptions {
    pub fn by(by: u64) -> Self {
        Self { by, ..Self::default() }
    }

    /// Mark the call as system-initiated.
    pub fn system_override(mut self) -> Self {
        self.allow_system_override = true;
        self
    }
}

/// Classified answer for one limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitResult {
    pub limit: String,
    pub outcome: Outcome,
    /// Usage before this call.
    pub usage: u64,
    /// Usage if the action goes ahead.
    pub projected: u64,
    pub cap: Cap,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl LimitResult {
    pub fn is_allowed(&self) -> bool {
        self.outcome.is_allowed()
    }

    pub fn is_blocked(&self) -> bool {
        self.outcome.is_blocked()
    }

    fn undefined(plan: &str, limit: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("plan".to_string(), plan.to_string());
        metadata.insert("undefined".to_string(), "true".to_string());
        Self {
            limit: limit.to_string(),
            outcome: Outcome::Ok,
            usage: 0,
            projected: 0,
            cap: Cap::Unlimited,
            message: format!("plan '{plan}' does not limit {limit}"),
            metadata,
        }
    }
}

/// Builder for [`LimitChecker`].
///
/// Starts with in-memory stores, the system clock and a [`NullSink`]; swap any
/// of them before calling [`build`](Self::build).
pub struct LimitCheckerBuilder<S, C, A, E> {
    registry: Arc<PlanRegistry>,
    states: S,
    counters: C,
    assignments: A,
    sink: E,
    clock: Arc<dyn Clock>,
    retry: UpsertRetry,
    live_counts: HashMap<String, Arc<dyn LiveCount>>,
}

impl LimitCheckerBuilder<InMemoryStateStore, InMemoryCounterStore, InMemoryAssignmentStore, NullSink> {
    pub fn new(registry: Arc<PlanRegistry>) -> Self {
        Self {
            registry,
            states: InMemoryStateStore::new(),
            counters: InMemoryCounterStore::new(),
            assignments: InMemoryAssignmentStore::new(),
            sink: NullSink,
            clock: Arc::new(SystemClock),
            retry: UpsertRetry::default(),
            live_counts: HashMap::new(),
        }
    }
}

impl<S, C, A, E> LimitCheckerBuilder<S, C, A, E> {
    pub fn state_store<S2: StateStore>(self, states: S2) -> LimitCheckerBuilder<S2, C, A, E> {
        LimitCheckerBuilder {
            registry: self.registry,
            states,
            counters: self.counters,
            assignments: self.assignments,
            sink: self.sink,
            clock: self.clock,
            retry: self.retry,
            live_counts: self.live_counts,
        }
    }

    pub fn counter_store<C2: CounterStore>(self, counters: C2) -> LimitCheckerBuilder<S, C2, A, E> {
        LimitCheckerBuilder {
            registry: self.registry,
            states: self.states,
            counters,
            assignments: self.assignments,
            sink: self.sink,
            clock: self.clock,
            retry: self.retry,
            live_counts: self.live_counts,
        }
    }

    pub fn assignment_store<A2: AssignmentStore>(
        self,
        assignments: A2,
    ) -> LimitCheckerBuilder<S, C, A2, E> {
        LimitCheckerBuilder {
            registry: self.registry,
            states: self.states,
            counters: self.counters,
            assignments,
            sink: self.sink,
            clock: self.clock,
            retry: self.retry,
            live_counts: self.live_counts,
        }
    }

    pub fn sink<E2: EventSink>(self, sink: E2) -> LimitCheckerBuilder<S, C, A, E2> {
        LimitCheckerBuilder {
            registry: self.registry,
            states: self.states,
            counters: self.counters,
            assignments: self.assignments,
            sink,
            clock: self.clock,
            retry: self.retry,
            live_counts: self.live_counts,
        }
    }

    pub fn clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn retry(mut self, retry: UpsertRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Register the live-count source for a persistent limit key.
    pub fn live_count<L: LiveCount + 'static>(mut self, limit: impl Into<String>, source: L) -> Self {
        self.live_counts.insert(limit.into(), Arc::new(source));
        self
    }

    /// Validate and build.
    ///
    /// Every persistent limit in any plan needs a live-count source.
    pub fn build(self) -> Result<LimitChecker<S, C, A, E>, ConfigError>
    where
        S: StateStore,
        C: CounterStore,
        A: AssignmentStore,
        E: EventSink,
    {
        if let Some(missing) = self
            .registry
            .persistent_limit_keys()
            .into_iter()
            .find(|key| !self.live_counts.contains_key(*key))
        {
            return Err(ConfigError::MissingLiveCount { limit: missing.to_string() });
        }

        tracing::debug!(
            plans = self.registry.plans().count(),
            live_counts = self.live_counts.len(),
            "limit checker built"
        );
        Ok(LimitChecker {
            resolver: PlanResolver::new(self.registry, self.assignments),
            states: self.states,
            usage: UsageAccounting::new(self.counters).with_retry(self.retry),
            live_counts: self.live_counts,
            clock: self.clock,
            sink: self.sink,
            grace: GraceManager::new(),
        })
    }
}

/// Plan limit enforcement entry point.
pub struct LimitChecker<
    S = InMemoryStateStore,
    C = InMemoryCounterStore,
    A = InMemoryAssignmentStore,
    E = NullSink,
> {
    pub(crate) resolver: PlanResolver<A>,
    pub(crate) states: S,
    pub(crate) usage: UsageAccounting<C>,
    pub(crate) live_counts: HashMap<String, Arc<dyn LiveCount>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sink: E,
    grace: GraceManager,
}

impl LimitChecker {
    pub fn builder(
        registry: Arc<PlanRegistry>,
    ) -> LimitCheckerBuilder<InMemoryStateStore, InMemoryCounterStore, InMemoryAssignmentStore, NullSink>
    {
        LimitCheckerBuilder::new(registry)
    }
}

impl<S, C, A, E> fmt::Debug for LimitChecker<S, C, A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut live: Vec<&String> = self.live_counts.keys().collect();
        live.sort();
        f.debug_struct("LimitChecker")
            .field("live_counts", &live)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<S, C, A, E> LimitChecker<S, C, A, E>
where
    S: StateStore,
    C: CounterStore,
    A: AssignmentStore,
    E: EventSink + Sync,
    E::Future: Send + 'static,
{
    pub fn registry(&self) -> &PlanRegistry {
        self.resolver.registry()
    }

    pub fn state_store(&self) -> &S {
        &self.states
    }

    pub fn counter_store(&self) -> &C {
        self.usage.counters()
    }

    /// Decide whether `opts.by` more units of `limit` would be allowed.
    ///
    /// Updates enforcement state and emits events, but never consumes
    /// allowance.
    pub async fn evaluate(
        &self,
        billable: &Billable,
        limit: &str,
        opts: CheckOptions,
    ) -> Result<LimitResult, WardenError> {
        self.check(billable, limit, opts, false).await
    }

    /// Like [`evaluate`](Self::evaluate), then record the increment for a
    /// per-period limit unless the outcome is blocked.
    pub async fn commit(
        &self,
        billable: &Billable,
        limit: &str,
        opts: CheckOptions,
    ) -> Result<LimitResult, WardenError> {
        self.check(billable, limit, opts, true).await
    }

    async fn check(
        &self,
        billable: &Billable,
        limit: &str,
        opts: CheckOptions,
        record: bool,
    ) -> Result<LimitResult, WardenError> {
        let now = self.clock.now();
        let resolved = self.resolver.resolve(billable).await?;
        let plan = resolved.plan.key();
        let Some(spec) = resolved.plan.limit(limit) else {
            tracing::debug!(billable = %billable.id(), limit, plan, "limit not defined by plan");
            return Ok(LimitResult::undefined(plan, limit));
        };

        let window = self.window_for(spec, billable, now)?;

        // Usage read, transition and increment form one critical section per
        // (billable, limit), so concurrent commits see each other's increments.
        let key = StateKey::new(billable.id().clone(), spec.key());
        let mut guard = self.states.lock(&key).await?;
        let usage = self.usage_in(spec, billable.id(), window.as_ref()).await?;
        let projected = usage.saturating_add(opts.by);

        let input = TransitionInput { billable: billable.id(), projected, now, window: window.as_ref() };
        let transition = self.grace.transition(spec, guard.state(), input);
        guard.save().await?;

        if record && !transition.outcome.is_blocked() {
            if let Some(window) = &window {
                self.usage.increment(billable.id(), spec.key(), window, opts.by, now).await?;
            }
        }
        drop(guard);

        for event in transition.events {
            emit_best_effort(self.sink.clone(), event).await;
        }

        let mut outcome = transition.outcome;

        let mut metadata = BTreeMap::new();
        metadata.insert("plan".to_string(), plan.to_string());
        metadata.insert("after_limit".to_string(), spec.after_limit().to_string());
        if let Some(window) = &window {
            metadata.insert("period_start".to_string(), window.start.to_rfc3339());
            metadata.insert("period_end".to_string(), window.end.to_rfc3339());
        }
        if outcome.is_blocked() && opts.allow_system_override {
            tracing::info!(billable = %billable.id(), limit, "blocked outcome overridden for system call");
            metadata.insert(SYSTEM_OVERRIDE_KEY.to_string(), "true".to_string());
            outcome = Outcome::Warning { threshold: spec.highest_crossed(projected).unwrap_or(1.0) };
        }

        tracing::debug!(
            billable = %billable.id(),
            limit,
            usage,
            projected,
            outcome = outcome.name(),
            record,
            "limit evaluated"
        );
        Ok(LimitResult {
            limit: spec.key().to_string(),
            message: message(spec, &outcome, projected),
            outcome,
            usage,
            projected,
            cap: spec.cap(),
            metadata,
        })
    }

    /// Clear every enforcement field for the pair. For remediation tooling.
    pub async fn reset_state(&self, billable: &BillableId, limit: &str) -> Result<(), WardenError> {
        let key = StateKey::new(billable.clone(), limit);
        self.states.reset(&key).await?;
        tracing::info!(%billable, limit, "enforcement state reset");
        Ok(())
    }

    pub async fn feature_enabled(&self, billable: &Billable, feature: &str) -> Result<bool, WardenError> {
        Ok(self.resolver.resolve(billable).await?.plan.has_feature(feature))
    }

    /// Error with [`WardenError::FeatureNotEntitled`] unless the plan includes `feature`.
    pub async fn require_feature(&self, billable: &Billable, feature: &str) -> Result<(), WardenError> {
        let resolved = self.resolver.resolve(billable).await?;
        if resolved.plan.has_feature(feature) {
            return Ok(());
        }
        Err(WardenError::FeatureNotEntitled {
            plan: resolved.plan.key().to_string(),
            feature: feature.to_string(),
        })
    }

    /// Current usage; 0 when the plan does not define the limit.
    pub async fn current_usage(&self, billable: &Billable, limit: &str) -> Result<u64, WardenError> {
        let resolved = self.resolver.resolve(billable).await?;
        let Some(spec) = resolved.plan.limit(limit) else {
            return Ok(0);
        };
        let window = self.window_for(spec, billable, self.clock.now())?;
        self.usage_in(spec, billable.id(), window.as_ref()).await
    }

    /// Units left before the cap; `None` when unlimited or undefined.
    pub async fn remaining(&self, billable: &Billable, limit: &str) -> Result<Option<u64>, WardenError> {
        let cap = self.cap_of(billable, limit).await?;
        let usage = self.current_usage(billable, limit).await?;
        Ok(cap.remaining(usage))
    }

    /// Usage as a percentage of the cap; `None` when unlimited or undefined.
    pub async fn percent_used(&self, billable: &Billable, limit: &str) -> Result<Option<f64>, WardenError> {
        let cap = self.cap_of(billable, limit).await?;
        let usage = self.current_usage(billable, limit).await?;
        Ok(cap.fraction(usage).map(|f| f * 100.0))
    }

    /// Units above the cap.
    pub async fn overage(&self, billable: &Billable, limit: &str) -> Result<u64, WardenError> {
        match self.cap_of(billable, limit).await? {
            Cap::Limited(cap) => Ok(self.current_usage(billable, limit).await?.saturating_sub(cap)),
            Cap::Unlimited => Ok(0),
        }
    }

    /// Whether one more unit would be denied right now. Read-only.
    pub async fn blocked(&self, billable: &Billable, limit: &str) -> Result<bool, WardenError> {
        Ok(self.status(billable, limit).await?.is_some_and(|status| status.blocked))
    }

    /// Pin `plan` to `billable`, replacing any previous assignment.
    pub async fn assign_plan(
        &self,
        billable: &BillableId,
        plan: &str,
        source: AssignmentSource,
    ) -> Result<PlanAssignment, WardenError> {
        if self.registry().plan(plan).is_none() {
            return Err(WardenError::UnknownPlan { plan: plan.to_string() });
        }
        let assignment = PlanAssignment {
            billable: billable.clone(),
            plan: plan.to_string(),
            source,
            assigned_at: self.clock.now(),
        };
        self.resolver.assignments().put(assignment.clone()).await?;
        tracing::info!(%billable, plan, %source, "plan assigned");
        Ok(assignment)
    }

    /// Drop a manual assignment; returns whether one existed.
    pub async fn remove_assignment(&self, billable: &BillableId) -> Result<bool, WardenError> {
        let removed = self.resolver.assignments().remove(billable).await?;
        if removed {
            tracing::info!(%billable, "plan assignment removed");
        }
        Ok(removed)
    }

    async fn cap_of(&self, billable: &Billable, limit: &str) -> Result<Cap, WardenError> {
        let resolved = self.resolver.resolve(billable).await?;
        Ok(resolved.plan.limit(limit).map_or(Cap::Unlimited, LimitSpec::cap))
    }

    pub(crate) fn window_for(
        &self,
        spec: &LimitSpec,
        billable: &Billable,
        now: DateTime<Utc>,
    ) -> Result<Option<Window>, WardenError> {
        spec.period().map(|p| period::window(p, now, billable)).transpose()
    }

    pub(crate) async fn usage_in(
        &self,
        spec: &LimitSpec,
        billable: &BillableId,
        window: Option<&Window>,
    ) -> Result<u64, WardenError> {
        match window {
            Some(window) => Ok(self.usage.current_usage(billable, spec.key(), window).await?),
            None => {
                let source = self.live_counts.get(spec.key()).ok_or_else(|| {
                    ConfigError::MissingLiveCount { limit: spec.key().to_string() }
                })?;
                Ok(source.count(billable, spec.count_scope()).await?)
            }
        }
    }
}

fn message(spec: &LimitSpec, outcome: &Outcome, projected: u64) -> String {
    let limit = spec.key();
    let cap = spec.cap();
    match outcome {
        Outcome::Ok => format!("{projected} of {cap} {limit} used"),
        Outcome::Warning { threshold } => format!(
            "{projected} of {cap} {limit} used; past the {:.0}% warning threshold",
            threshold * 100.0
        ),
        Outcome::Grace { ends_at } => format!(
            "{limit} limit of {cap} exceeded; grace period ends {}",
            ends_at.to_rfc3339()
        ),
        Outcome::Blocked => format!("{limit} limit of {cap} reached; upgrade the plan to continue"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::period::PeriodSpec;
    use crate::plan::{AfterLimit, CountScope, Plan};
    use crate::telemetry::{EnforcementEvent, MemorySink};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap()
    }

    fn registry() -> Arc<PlanRegistry> {
        let free = Plan::builder("free")
            .feature("api_access")
            .limit(
                LimitSpec::builder("projects")
                    .to(3)
                    .after_limit(AfterLimit::BlockUsage)
                    .build()
                    .unwrap(),
            )
            .limit(LimitSpec::builder("exports").to(2).per(PeriodSpec::Month).build().unwrap())
            .build()
            .unwrap();
        let pro = Plan::builder("pro")
            .limit(LimitSpec::builder("projects").unlimited().build().unwrap())
            .build()
            .unwrap();
        Arc::new(PlanRegistry::builder().plan(free).plan(pro).default_plan("free").build().unwrap())
    }

    fn counter(n: Arc<AtomicU64>) -> impl LiveCount {
        move |_: &BillableId, _: Option<&CountScope>| -> Result<u64, StoreError> {
            Ok(n.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn build_requires_live_count_for_persistent_limits() {
        let err = LimitChecker::builder(registry()).build().unwrap_err();
        assert_eq!(err, ConfigError::MissingLiveCount { limit: "projects".into() });
    }

    #[tokio::test]
    async fn persistent_block_and_recover() {
        let count = Arc::new(AtomicU64::new(3));
        let sink = MemorySink::new();
        let checker = LimitChecker::builder(registry())
            .live_count("projects", counter(count.clone()))
            .clock(ManualClock::new(t0()))
            .sink(sink.clone())
            .build()
            .unwrap();
        let org = Billable::new("org_1");

        let result = checker.evaluate(&org, "projects", CheckOptions::default()).await.unwrap();
        assert_eq!(result.outcome, Outcome::Blocked);
        assert_eq!((result.usage, result.projected), (3, 4));
        assert!(result.message.contains("reached"));
        assert!(sink
            .events()
            .contains(&EnforcementEvent::Blocked { billable: "org_1".into(), limit: "projects".into() }));

        count.store(2, Ordering::SeqCst);
        let result = checker.evaluate(&org, "projects", CheckOptions::default()).await.unwrap();
        assert!(result.is_allowed());
    }

    #[tokio::test]
    async fn system_override_downgrades_block_but_keeps_state() {
        let checker = LimitChecker::builder(registry())
            .live_count("projects", counter(Arc::new(AtomicU64::new(3))))
            .build()
            .unwrap();
        let org = Billable::new("org_1");

        let result = checker
            .evaluate(&org, "projects", CheckOptions::default().system_override())
            .await
            .unwrap();
        assert!(result.is_allowed());
        assert_eq!(result.metadata.get(SYSTEM_OVERRIDE_KEY).map(String::as_str), Some("true"));

        let key = StateKey::new("org_1".into(), "projects");
        assert!(checker.state_store().peek(&key).await.unwrap().unwrap().is_blocked());
    }

    #[tokio::test]
    async fn evaluate_previews_and_commit_consumes() {
        let checker = LimitChecker::builder(registry())
            .live_count("projects", counter(Arc::new(AtomicU64::new(0))))
            .clock(ManualClock::new(t0()))
            .build()
            .unwrap();
        let org = Billable::new("org_1");

        checker.evaluate(&org, "exports", CheckOptions::default()).await.unwrap();
        assert_eq!(checker.current_usage(&org, "exports").await.unwrap(), 0);

        checker.commit(&org, "exports", CheckOptions::default()).await.unwrap();
        checker.commit(&org, "exports", CheckOptions::default()).await.unwrap();
        assert_eq!(checker.current_usage(&org, "exports").await.unwrap(), 2);
        assert_eq!(checker.remaining(&org, "exports").await.unwrap(), Some(0));
        assert_eq!(checker.percent_used(&org, "exports").await.unwrap(), Some(100.0));

        let third = checker.commit(&org, "exports", CheckOptions::default()).await.unwrap();
        assert!(matches!(third.outcome, Outcome::Grace { .. }));
        assert_eq!(checker.current_usage(&org, "exports").await.unwrap(), 3);
        assert_eq!(checker.overage(&org, "exports").await.unwrap(), 1);
        assert_eq!(third.metadata["period_start"], "2025-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn undefined_limits_are_unlimited() {
        let checker = LimitChecker::builder(registry())
            .live_count("projects", counter(Arc::new(AtomicU64::new(0))))
            .build()
            .unwrap();
        let org = Billable::new("org_1");
        let result = checker.commit(&org, "webhooks", CheckOptions::by(50)).await.unwrap();
        assert_eq!(result.outcome, Outcome::Ok);
        assert_eq!(result.cap, Cap::Unlimited);
        assert_eq!(checker.remaining(&org, "webhooks").await.unwrap(), None);
        assert!(checker.state_store().is_empty());
    }

    #[tokio::test]
    async fn features_and_assignments() {
        let checker = LimitChecker::builder(registry())
            .live_count("projects", counter(Arc::new(AtomicU64::new(10))))
            .build()
            .unwrap();
        let org = Billable::new("org_1");

        assert!(checker.feature_enabled(&org, "api_access").await.unwrap());
        assert!(checker.require_feature(&org, "sso").await.is_err());
        assert!(checker.blocked(&org, "projects").await.unwrap());

        checker.assign_plan(org.id(), "pro", AssignmentSource::Admin).await.unwrap();
        assert!(!checker.feature_enabled(&org, "api_access").await.unwrap());
        assert!(!checker.blocked(&org, "projects").await.unwrap());
        assert!(checker.evaluate(&org, "projects", CheckOptions::default()).await.unwrap().is_allowed());

        assert!(checker.remove_assignment(org.id()).await.unwrap());
        assert!(!checker.remove_assignment(org.id()).await.unwrap());
        let err = checker.assign_plan(org.id(), "platinum", AssignmentSource::Manual).await.unwrap_err();
        assert!(matches!(err, WardenError::UnknownPlan { .. }));
    }
}
