use super::CounterKey;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Usage recorded for one billable, limit and window.
///
/// Rows are never rewritten once their window has passed; rollover creates a
/// new row keyed by the new window start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub key: CounterKey,
    pub period_end: DateTime<Utc>,
    pub used: u64,
    pub last_used_at: DateTime<Utc>,
}

/// Storage for per-period usage counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StoreError>;

    /// Insert a new row. Fails with [`StoreError::Conflict`] if the key exists.
    async fn insert(&self, counter: UsageCounter) -> Result<(), StoreError>;

    /// Atomically add `by` to an existing row and return the new total.
    ///
    /// Returns `Ok(None)` when no row exists for `key`.
    async fn increment(
        &self,
        key: &CounterKey,
        by: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError>;
}

/// In-memory counter store with unique-key semantics.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCounterStore {
    rows: Arc<Mutex<HashMap<CounterKey, UsageCounter>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows for a billable and limit, oldest window first.
    pub fn rows_for(&self, billable: &str, limit: &str) -> Vec<UsageCounter> {
        let guard = self.rows.lock().expect("counter store poisoned");
        let mut rows: Vec<UsageCounter> = guard
            .values()
            .filter(|c| c.key.billable.as_str() == billable && c.key.limit == limit)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.key.period_start);
        rows
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StoreError> {
        let guard = self.rows.lock().expect("counter store poisoned");
        Ok(guard.get(key).cloned())
    }

    async fn insert(&self, counter: UsageCounter) -> Result<(), StoreError> {
        let mut guard = self.rows.lock().expect("counter store poisoned");
        if guard.contains_key(&counter.key) {
            return Err(StoreError::Conflict { key: counter.key.to_string() });
        }
        guard.insert(counter.key.clone(), counter);
        Ok(())
    }

    async fn increment(
        &self,
        key: &CounterKey,
        by: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError> {
        let mut guard = self.rows.lock().expect("counter store poisoned");
        Ok(guard.get_mut(key).map(|row| {
            row.used = row.used.saturating_add(by);
            row.last_used_at = at;
            row.used
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billable::BillableId;
    use chrono::TimeZone;

    #[tokio::test]
    async fn insert_is_unique_and_increment_adds() {
        let store = InMemoryCounterStore::new();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let key = CounterKey::new(BillableId::new("org_1"), "exports", start);
        let row = UsageCounter { key: key.clone(), period_end: end, used: 1, last_used_at: start };

        store.insert(row.clone()).await.unwrap();
        assert!(store.insert(row).await.unwrap_err().is_conflict());
        assert_eq!(store.increment(&key, 2, start).await.unwrap(), Some(3));

        let other = CounterKey::new(BillableId::new("org_1"), "exports", end);
        assert_eq!(store.increment(&other, 1, end).await.unwrap(), None);
        assert_eq!(store.rows_for("org_1", "exports").len(), 1);
    }
}
