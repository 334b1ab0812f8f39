#![forbid(unsafe_code)]

//! # planwarden
//!
//! Plan limit enforcement for SaaS billables: decide whether an account may
//! consume more of a limited resource, and track the warning → grace → blocked
//! lifecycle when it goes over.
//!
//! ## Features
//!
//! - **Persistent caps** counted live from caller-supplied sources
//! - **Per-period allowances** with lazily created counters per window
//!   (day, week, calendar month, fixed duration, billing cycle, custom)
//! - **Grace periods** frozen at exceed time, blocking once they run out
//! - **Warning thresholds**, monotonic for caps and re-armed every window
//! - **Row-locked state transitions** and race-safe counter upserts
//! - **Event sinks** built on `tower::Service`
//! - **Read-only snapshots** for dashboards and banners
//!
//! ## Quick Start
//!
//! ```rust
//! use planwarden::{
//!     AfterLimit, Billable, BillableId, CheckOptions, CountScope, LimitChecker, LimitSpec,
//!     Outcome, Plan, PlanRegistry, StoreError,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), planwarden::WardenError> {
//!     let free = Plan::builder("free")
//!         .limit(LimitSpec::builder("projects").to(3).after_limit(AfterLimit::BlockUsage).build()?)
//!         .build()?;
//!     let registry = Arc::new(PlanRegistry::builder().plan(free).default_plan("free").build()?);
//!
//!     let checker = LimitChecker::builder(registry)
//!         .live_count("projects", |_: &BillableId, _: Option<&CountScope>| -> Result<u64, StoreError> {
//!             Ok(3)
//!         })
//!         .build()?;
//!
//!     let result = checker.evaluate(&Billable::new("org_1"), "projects", CheckOptions::default()).await?;
//!     assert_eq!(result.outcome, Outcome::Blocked);
//!     Ok(())
//! }
//! ```

pub mod billable;
pub mod checker;
pub mod clock;
pub mod error;
pub mod grace;
pub mod period;
pub mod plan;
pub mod prelude;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod usage;

// Re-exports
pub use billable::{Billable, BillableId, BillingAnchor};
pub use checker::{CheckOptions, LimitChecker, LimitCheckerBuilder, LimitResult, SYSTEM_OVERRIDE_KEY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, StoreError, WardenError};
pub use grace::{GraceManager, Outcome, Transition, TransitionInput};
pub use period::{window, CustomPeriod, PeriodSpec, RawWindow, Window};
pub use plan::{
    AfterLimit, Cap, CountScope, LimitSpec, LimitSpecBuilder, Plan, PlanBuilder, PlanRegistry,
    PlanRegistryBuilder,
};
pub use report::{highest_severity, LimitStatus, Severity};
pub use resolver::{PlanResolver, PlanSource, ResolvedPlan};
pub use retry::{RecordingSleeper, Sleeper, TokioSleeper, UpsertRetry};
pub use store::{
    AssignmentSource, AssignmentStore, CounterKey, CounterStore, EnforcementState,
    InMemoryAssignmentStore, InMemoryCounterStore, InMemoryStateGuard, InMemoryStateStore,
    PlanAssignment, StateData, StateGuard, StateKey, StateStore, UsageCounter,
};
pub use usage::{LiveCount, UsageAccounting};
