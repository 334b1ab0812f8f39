use crate::billable::BillableId;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Who put a manual plan assignment in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Manual,
    Admin,
    System,
}

impl fmt::Display for AssignmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentSource::Manual => write!(f, "manual"),
            AssignmentSource::Admin => write!(f, "admin"),
            AssignmentSource::System => write!(f, "system"),
        }
    }
}

/// A plan pinned to a billable regardless of its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAssignment {
    pub billable: BillableId,
    pub plan: String,
    pub source: AssignmentSource,
    pub assigned_at: DateTime<Utc>,
}

/// Storage for manual plan assignments; at most one row per billable.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get(&self, billable: &BillableId) -> Result<Option<PlanAssignment>, StoreError>;

    /// Insert or replace the assignment for `assignment.billable`.
    async fn put(&self, assignment: PlanAssignment) -> Result<(), StoreError>;

    /// Remove the assignment; returns whether one existed.
    async fn remove(&self, billable: &BillableId) -> Result<bool, StoreError>;
}

/// In-memory assignment store.
#[derive(Default, Clone, Debug)]
pub struct InMemoryAssignmentStore {
    rows: Arc<RwLock<HashMap<BillableId, PlanAssignment>>>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn get(&self, billable: &BillableId) -> Result<Option<PlanAssignment>, StoreError> {
        let guard = self.rows.read().expect("assignment store poisoned");
        Ok(guard.get(billable).cloned())
    }

    async fn put(&self, assignment: PlanAssignment) -> Result<(), StoreError> {
        let mut guard = self.rows.write().expect("assignment store poisoned");
        guard.insert(assignment.billable.clone(), assignment);
        Ok(())
    }

    async fn remove(&self, billable: &BillableId) -> Result<bool, StoreError> {
        let mut guard = self.rows.write().expect("assignment store poisoned");
        Ok(guard.remove(billable).is_some())
    }
}
