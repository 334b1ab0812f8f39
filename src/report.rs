//! Read-only status for presentation.
//!
//! Everything here goes through [`StateStore::peek`] and plain usage reads.
//! Nothing takes the row lock, mutates state or emits events, so a snapshot can
//! be slightly stale and must not be used for the blocking decision itself.

use crate::billable::Billable;
use crate::checker::LimitChecker;
use crate::error::WardenError;
use crate::grace::Outcome;
use crate::period::Window;
use crate::plan::{AfterLimit, Cap, LimitSpec};
use crate::store::{AssignmentStore, CounterStore, EnforcementState, StateKey, StateStore};
use crate::telemetry::EventSink;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Ordering of how bad a limit's situation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warning,
    Grace,
    Blocked,
}

impl From<&Outcome> for Severity {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Ok => Severity::Ok,
            Outcome::Warning { .. } => Severity::Warning,
            Outcome::Grace { .. } => Severity::Grace,
            Outcome::Blocked => Severity::Blocked,
        }
    }
}

/// Point-in-time status of one limit for one billable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitStatus {
    pub limit: String,
    pub current_usage: u64,
    pub cap: Cap,
    pub remaining: Option<u64>,
    /// 0 to 100, or above when over the cap; `None` when unlimited.
    pub percent_used: Option<f64>,
    /// Whether one more unit would currently be let through.
    pub allowed: bool,
    /// Highest warning threshold at or below current usage.
    pub warning_threshold: Option<f64>,
    pub grace_active: bool,
    pub grace_ends_at: Option<DateTime<Utc>>,
    pub blocked: bool,
    /// Accounting window for per-period limits.
    pub window: Option<Window>,
}

impl LimitStatus {
    pub fn severity(&self) -> Severity {
        if self.blocked {
            Severity::Blocked
        } else if self.grace_active {
            Severity::Grace
        } else if self.warning_threshold.is_some() || self.cap.is_exceeded_by(self.current_usage) {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }

    fn derive(
        spec: &LimitSpec,
        usage: u64,
        state: EnforcementState,
        window: Option<Window>,
        now: DateTime<Utc>,
    ) -> Self {
        let cap = spec.cap();
        let at_cap = cap.is_exceeded_by(usage.saturating_add(1));
        let exceeded = state.is_exceeded();
        let grace_ends_at = if exceeded { state.grace_ends_at() } else { None };

        let allowed = !at_cap
            || match spec.after_limit() {
                AfterLimit::JustWarn => true,
                AfterLimit::BlockUsage => false,
                AfterLimit::GraceThenBlock => {
                    !exceeded || grace_ends_at.is_some_and(|ends_at| now < ends_at)
                }
            };
        let grace_active = spec.after_limit() == AfterLimit::GraceThenBlock
            && at_cap
            && exceeded
            && grace_ends_at.is_some_and(|ends_at| now < ends_at);

        Self {
            limit: spec.key().to_string(),
            current_usage: usage,
            cap,
            remaining: cap.remaining(usage),
            percent_used: cap.fraction(usage).map(|f| f * 100.0),
            allowed,
            warning_threshold: spec.highest_crossed(usage),
            grace_active,
            grace_ends_at,
            blocked: !allowed,
            window,
        }
    }
}

/// Worst severity across `statuses`; `Ok` when empty.
pub fn highest_severity<'a>(statuses: impl IntoIterator<Item = &'a LimitStatus>) -> Severity {
    statuses.into_iter().map(LimitStatus::severity).max().unwrap_or(Severity::Ok)
}

impl<S, C, A, E> LimitChecker<S, C, A, E>
where
    S: StateStore,
    C: CounterStore,
    A: AssignmentStore,
    E: EventSink + Sync,
    E::Future: Send + 'static,
{
    /// Status of every limit the billable's plan defines, ordered by limit key.
    pub async fn snapshot(&self, billable: &Billable) -> Result<Vec<LimitStatus>, WardenError> {
        let resolved = self.resolver.resolve(billable).await?;
        let now = self.clock.now();
        let mut statuses = Vec::new();
        for spec in resolved.plan.limits() {
            statuses.push(self.status_of(spec, billable, now).await?);
        }
        Ok(statuses)
    }

    /// Status of one limit; `None` when the plan does not define it.
    pub async fn status(
        &self,
        billable: &Billable,
        limit: &str,
    ) -> Result<Option<LimitStatus>, WardenError> {
        let resolved = self.resolver.resolve(billable).await?;
        match resolved.plan.limit(limit) {
            Some(spec) => Ok(Some(self.status_of(spec, billable, self.clock.now()).await?)),
            None => Ok(None),
        }
    }

    async fn status_of(
        &self,
        spec: &LimitSpec,
        billable: &Billable,
        now: DateTime<Utc>,
    ) -> Result<LimitStatus, WardenError> {
        let window = self.window_for(spec, billable, now)?;
        let usage = self.usage_in(spec, billable.id(), window.as_ref()).await?;
        let key = StateKey::new(billable.id().clone(), spec.key());
        let mut state = self.states.peek(&key).await?.unwrap_or_default();
        if window.is_some_and(|w| state.is_stale_for(w.start)) {
            state = EnforcementState::default();
        }
        Ok(LimitStatus::derive(spec, usage, state, window, now))
    }
}
