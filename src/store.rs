//! Storage interfaces for the three persisted tables.
//!
//! - [`StateStore`]: enforcement state, one row per (billable, limit), mutated only
//!   while a [`StateGuard`] from [`StateStore::lock`] is held.
//! - [`CounterStore`]: per-period usage counters, one row per
//!   (billable, limit, window start), with unique-key insert and atomic increment.
//! - [`AssignmentStore`]: manual plan assignments, one row per billable.
//!
//! Each trait ships with an in-memory backend. SQL or KV backends implement the
//! same traits with `SELECT ... FOR UPDATE`, `INSERT` + unique index, and
//! `UPDATE ... SET used = used + $1`.

pub mod assignment;
pub mod counter;
pub mod state;

pub use assignment::{AssignmentSource, AssignmentStore, InMemoryAssignmentStore, PlanAssignment};
pub use counter::{CounterStore, InMemoryCounterStore, UsageCounter};
pub use state::{
    EnforcementState, InMemoryStateGuard, InMemoryStateStore, StateData, StateGuard, StateStore,
};

use crate::billable::BillableId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of an enforcement-state row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub billable: BillableId,
    pub limit: String,
}

impl StateKey {
    pub fn new(billable: BillableId, limit: impl Into<String>) -> Self {
        Self { billable, limit: limit.into() }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.billable, self.limit)
    }
}

/// Primary key of a usage-counter row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub billable: BillableId,
    pub limit: String,
    pub period_start: DateTime<Utc>,
}

impl CounterKey {
    pub fn new(billable: BillableId, limit: impl Into<String>, period_start: DateTime<Utc>) -> Self {
        Self { billable, limit: limit.into(), period_start }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.billable, self.limit, self.period_start.to_rfc3339())
    }
}
