//! Convenient re-exports for common planwarden types.
pub use crate::{
    billable::{Billable, BillableId},
    checker::{CheckOptions, LimitChecker, LimitResult},
    clock::{Clock, ManualClock, SystemClock},
    error::{ConfigError, StoreError, WardenError},
    grace::Outcome,
    period::{PeriodSpec, Window},
    plan::{AfterLimit, Cap, CountScope, LimitSpec, Plan, PlanRegistry},
    report::{LimitStatus, Severity},
    store::{AssignmentSource, StateStore},
    telemetry::{EnforcementEvent, EventSink, LogSink, MemorySink, NullSink},
    usage::LiveCount,
};
