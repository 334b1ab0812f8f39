//! Usage accounting.
//!
//! Two independent modes, selected by whether the limit has a period:
//! - **Persistent caps** are recounted live on every call from a caller-supplied
//!   [`LiveCount`] source. Nothing is stored, so deleting a related entity is
//!   reflected immediately.
//! - **Per-period allowances** keep one [`UsageCounter`] row per window. Rows are
//!   created lazily on the first increment and only the row for the current
//!   window is ever read.

use crate::billable::BillableId;
use crate::error::StoreError;
use crate::period::Window;
use crate::plan::CountScope;
use crate::retry::UpsertRetry;
use crate::store::{CounterKey, CounterStore, UsageCounter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Live count of currently existing related entities for a persistent cap.
#[async_trait]
pub trait LiveCount: Send + Sync {
    async fn count(&self, billable: &BillableId, scope: Option<&CountScope>)
        -> Result<u64, StoreError>;
}

#[async_trait]
impl<F> LiveCount for F
where
    F: Fn(&BillableId, Option<&CountScope>) -> Result<u64, StoreError> + Send + Sync,
{
    async fn count(
        &self,
        billable: &BillableId,
        scope: Option<&CountScope>,
    ) -> Result<u64, StoreError> {
        self(billable, scope)
    }
}

/// Counter-backed accounting for per-period allowances.
#[derive(Debug, Clone)]
pub struct UsageAccounting<C> {
    counters: C,
    retry: UpsertRetry,
}

impl<C> UsageAccounting<C>
where
    C: CounterStore,
{
    pub fn new(counters: C) -> Self {
        Self { counters, retry: UpsertRetry::default() }
    }

    pub fn with_retry(mut self, retry: UpsertRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn counters(&self) -> &C {
        &self.counters
    }

    /// Usage recorded in `window`, or 0 when it has no row yet.
    pub async fn current_usage(
        &self,
        billable: &BillableId,
        limit: &str,
        window: &Window,
    ) -> Result<u64, StoreError> {
        let key = CounterKey::new(billable.clone(), limit, window.start);
        Ok(self.counters.get(&key).await?.map_or(0, |row| row.used))
    }

    /// Add `by` to the counter for `window`, creating the row if needed.
    ///
    /// A lost insert race falls back to an atomic increment of the row the winner
    /// created. Transient failures are retried up to the configured attempt
    /// budget and then surface as [`StoreError::RetriesExhausted`].
    pub async fn increment(
        &self,
        billable: &BillableId,
        limit: &str,
        window: &Window,
        by: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let key = CounterKey::new(billable.clone(), limit, window.start);
        let attempts = self.retry.max_attempts();

        for attempt in 1..=attempts {
            match self.upsert(&key, window, by, now).await {
                Ok(used) => {
                    tracing::debug!(counter = %key, by, used, attempt, "usage counter upserted");
                    return Ok(used);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(counter = %key, attempt, error = %e, "usage counter upsert contended; retrying");
                    self.retry.pause(attempt).await;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(counter = %key, attempts, error = %e, "usage counter upsert gave up");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::RetriesExhausted { key: key.to_string(), attempts })
    }

    async fn upsert(
        &self,
        key: &CounterKey,
        window: &Window,
        by: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if let Some(used) = self.counters.increment(key, by, now).await? {
            return Ok(used);
        }

        let row =
            UsageCounter { key: key.clone(), period_end: window.end, used: by, last_used_at: now };
        match self.counters.insert(row).await {
            Ok(()) => Ok(by),
            Err(e) if e.is_conflict() => self
                .counters
                .increment(key, by, now)
                .await?
                .ok_or_else(|| StoreError::transient(format!("counter {key} vanished after conflict"))),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RecordingSleeper;
    use crate::store::InMemoryCounterStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn january() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn february() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    /// Counter store whose first `increment` misses and first `insert` conflicts,
    /// as if another writer created the row in between.
    #[derive(Clone, Default)]
    struct RacingStore {
        inner: InMemoryCounterStore,
        inserts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CounterStore for RacingStore {
        async fn get(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StoreError> {
            self.inner.get(key).await
        }

        async fn insert(&self, counter: UsageCounter) -> Result<(), StoreError> {
            if self.inserts.fetch_add(1, Ordering::SeqCst) == 0 {
                let winner = UsageCounter { used: 1, ..counter.clone() };
                self.inner.insert(winner).await?;
                return Err(StoreError::Conflict { key: counter.key.to_string() });
            }
            self.inner.insert(counter).await
        }

        async fn increment(
            &self,
            key: &CounterKey,
            by: u64,
            at: DateTime<Utc>,
        ) -> Result<Option<u64>, StoreError> {
            self.inner.increment(key, by, at).await
        }
    }

    /// Counter store that always reports a transient failure.
    #[derive(Clone, Default)]
    struct FlakyStore {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn get(&self, _key: &CounterKey) -> Result<Option<UsageCounter>, StoreError> {
            Ok(None)
        }

        async fn insert(&self, _counter: UsageCounter) -> Result<(), StoreError> {
            Err(StoreError::transient("serialization failure"))
        }

        async fn increment(
            &self,
            _key: &CounterKey,
            _by: u64,
            _at: DateTime<Utc>,
        ) -> Result<Option<u64>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn missing_row_reads_zero_and_first_increment_inserts() {
        let accounting = UsageAccounting::new(InMemoryCounterStore::new());
        let org = BillableId::new("org_1");
        let now = january().start;
        assert_eq!(accounting.current_usage(&org, "exports", &january()).await.unwrap(), 0);
        assert_eq!(accounting.increment(&org, "exports", &january(), 2, now).await.unwrap(), 2);
        assert_eq!(accounting.increment(&org, "exports", &january(), 1, now).await.unwrap(), 3);
        assert_eq!(accounting.current_usage(&org, "exports", &january()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn new_window_gets_new_row() {
        let counters = InMemoryCounterStore::new();
        let accounting = UsageAccounting::new(counters.clone());
        let org = BillableId::new("org_1");
        accounting.increment(&org, "exports", &january(), 3, january().start).await.unwrap();
        assert_eq!(accounting.current_usage(&org, "exports", &february()).await.unwrap(), 0);
        accounting.increment(&org, "exports", &february(), 1, february().start).await.unwrap();

        let rows = counters.rows_for("org_1", "exports");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].used, 3);
        assert_eq!(rows[1].used, 1);
        assert_eq!(rows[1].period_end, february().end);
    }

    #[tokio::test]
    async fn lost_insert_race_falls_back_to_increment() {
        let store = RacingStore::default();
        let accounting = UsageAccounting::new(store.clone());
        let org = BillableId::new("org_1");
        let used =
            accounting.increment(&org, "exports", &january(), 1, january().start).await.unwrap();
        assert_eq!(used, 2);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1, "no second blind insert");
        assert_eq!(store.inner.rows_for("org_1", "exports").len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_bounded_budget() {
        let store = FlakyStore::default();
        let sleeper = RecordingSleeper::new();
        let accounting = UsageAccounting::new(store.clone()).with_retry(
            UpsertRetry::new(3, std::time::Duration::from_millis(1))
                .unwrap()
                .with_sleeper(sleeper.clone()),
        );
        let err = accounting
            .increment(&BillableId::new("org_1"), "exports", &january(), 1, january().start)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_transient());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.calls().len(), 2);
    }

    #[tokio::test]
    async fn closures_are_live_count_sources() {
        let source = |_: &BillableId, scope: Option<&CountScope>| -> Result<u64, StoreError> {
            Ok(if scope.is_some() { 2 } else { 5 })
        };
        let org = BillableId::new("org_1");
        assert_eq!(source.count(&org, None).await.unwrap(), 5);
        assert_eq!(source.count(&org, Some(&CountScope::new("active"))).await.unwrap(), 2);
    }
}
