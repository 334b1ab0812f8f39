//! Enforcement state machine.
//!
//! States are derived from stored fields, never stored:
//!
//! ```text
//!   ok ──(threshold crossed)──▶ warning
//!    │                            │
//!    └──────(over cap)────────────┴──▶ grace(ends_at) ──(now >= ends_at)──▶ blocked
//!                                  └─(block_usage)──────────────────────▶ blocked
//! ```
//!
//! [`GraceManager::transition`] is a pure function over the locked row. The
//! caller runs it while holding the row's [`StateGuard`](crate::store::StateGuard)
//! and dispatches the returned events only after the row is saved.

use crate::billable::BillableId;
use crate::period::Window;
use crate::plan::{AfterLimit, LimitSpec};
use crate::store::EnforcementState;
use crate::telemetry::EnforcementEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Classified decision for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Allowed, nothing to report.
    Ok,
    /// Allowed; usage is at or past `threshold` of the cap.
    Warning { threshold: f64 },
    /// Allowed for now; blocking begins at `ends_at`.
    Grace { ends_at: DateTime<Utc> },
    /// Denied.
    Blocked,
}

impl Outcome {
    pub fn is_allowed(&self) -> bool {
        !self.is_blocked()
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Outcome::Blocked)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Warning { .. } => "warning",
            Outcome::Grace { .. } => "grace",
            Outcome::Blocked => "blocked",
        }
    }
}

/// Result of one transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub outcome: Outcome,
    /// Events to dispatch once the row is committed, in the order they happened.
    pub events: Vec<EnforcementEvent>,
}

/// Inputs for one transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionInput<'a> {
    pub billable: &'a BillableId,
    /// Current usage plus the proposed increment.
    pub projected: u64,
    pub now: DateTime<Utc>,
    /// Current window for per-period limits; `None` for persistent caps.
    pub window: Option<&'a Window>,
}

/// Applies the enforcement transition rules for a single limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraceManager;

impl GraceManager {
    pub fn new() -> Self {
        Self
    }

    /// Advance `state` for an evaluation at `input.projected` usage.
    pub fn transition(
        &self,
        spec: &LimitSpec,
        state: &mut EnforcementState,
        input: TransitionInput<'_>,
    ) -> Transition {
        let TransitionInput { billable, projected, now, window } = input;
        let limit = spec.key();

        if let Some(window) = window {
            if state.is_stale_for(window.start) {
                tracing::debug!(%billable, limit, "enforcement state from previous window discarded");
                state.clear();
            }
        }

        let mut events = Vec::new();
        let crossed = spec.highest_crossed(projected);
        if let Some(threshold) = crossed {
            if Self::record_warning(state, threshold, window.is_some()) {
                events.push(EnforcementEvent::Warning {
                    billable: billable.clone(),
                    limit: limit.to_string(),
                    threshold,
                });
            }
        }

        let outcome = if spec.cap().is_exceeded_by(projected) {
            self.over_cap(spec, state, billable, now, &mut events)
        } else {
            if window.is_none() && state.is_exceeded() {
                tracing::info!(%billable, limit, projected, "limit → ok, usage back under cap");
                state.clear_episode();
            }
            Outcome::Ok
        };

        if let Some(window) = window {
            if *state != EnforcementState::default() {
                state.window_start = Some(window.start);
            }
        }

        let outcome = match (outcome, crossed) {
            (Outcome::Ok, Some(threshold)) => Outcome::Warning { threshold },
            (Outcome::Ok, None) if spec.cap().is_exceeded_by(projected) => {
                Outcome::Warning { threshold: 1.0 }
            }
            (other, _) => other,
        };
        Transition { outcome, events }
    }

    fn over_cap(
        &self,
        spec: &LimitSpec,
        state: &mut EnforcementState,
        billable: &BillableId,
        now: DateTime<Utc>,
        events: &mut Vec<EnforcementEvent>,
    ) -> Outcome {
        let limit = spec.key();
        let mode = spec.after_limit();

        if state.exceeded_at.is_none() {
            state.exceeded_at = Some(now);
            state.data.grace_seconds = spec.grace().map(|g| g.num_seconds());
            if mode == AfterLimit::GraceThenBlock {
                if let Some(ends_at) = state.grace_ends_at() {
                    tracing::info!(%billable, limit, %ends_at, "limit → grace");
                    events.push(EnforcementEvent::GraceStarted {
                        billable: billable.clone(),
                        limit: limit.to_string(),
                        ends_at,
                    });
                }
            }
        }

        match mode {
            AfterLimit::JustWarn => Outcome::Ok,
            AfterLimit::BlockUsage => {
                self.block(state, billable, limit, now, events);
                Outcome::Blocked
            }
            AfterLimit::GraceThenBlock => {
                let ends_at = match state.grace_ends_at() {
                    Some(ends_at) => ends_at,
                    None => {
                        tracing::warn!(
                            %billable,
                            limit,
                            "exceeded without a usable grace deadline; treating grace as expired"
                        );
                        state.exceeded_at.unwrap_or(now)
                    }
                };
                if now >= ends_at {
                    self.block(state, billable, limit, now, events);
                    Outcome::Blocked
                } else {
                    Outcome::Grace { ends_at }
                }
            }
        }
    }

    fn block(
        &self,
        state: &mut EnforcementState,
        billable: &BillableId,
        limit: &str,
        now: DateTime<Utc>,
        events: &mut Vec<EnforcementEvent>,
    ) {
        if state.blocked_at.is_none() {
            state.blocked_at = Some(now);
            tracing::info!(%billable, limit, "limit → blocked");
            events.push(EnforcementEvent::Blocked {
                billable: billable.clone(),
                limit: limit.to_string(),
            });
        }
    }

    /// Record `threshold` and report whether it is newly announced.
    ///
    /// Persistent caps announce only thresholds above the last one, forever.
    /// Per-period limits announce each threshold once per window.
    fn record_warning(state: &mut EnforcementState, threshold: f64, per_period: bool) -> bool {
        if per_period {
            let warned = &mut state.data.warned_thresholds;
            if warned.iter().any(|t| *t >= threshold) {
                return false;
            }
            warned.push(threshold);
            warned.sort_by(f64::total_cmp);
        } else if state.last_warn_threshold.is_some_and(|last| threshold <= last) {
            return false;
        }
        state.last_warn_threshold = Some(threshold);
        true
    }
}
