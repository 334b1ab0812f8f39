#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use planwarden::{BillableId, CountScope, LiveCount, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

pub fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// Live count source whose value the test sets directly.
#[derive(Clone, Debug, Default)]
pub struct FixedCount(Arc<AtomicU64>);

impl FixedCount {
    pub fn new(n: u64) -> Self {
        Self(Arc::new(AtomicU64::new(n)))
    }

    pub fn set(&self, n: u64) {
        self.0.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl LiveCount for FixedCount {
    async fn count(&self, _billable: &BillableId, _scope: Option<&CountScope>) -> Result<u64, StoreError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// Live count source keyed by billable, with per-scope overrides.
#[derive(Clone, Debug, Default)]
pub struct PerBillableCount {
    counts: Arc<Mutex<HashMap<(String, Option<String>), u64>>>,
}

impl PerBillableCount {
    pub fn set(&self, billable: &str, scope: Option<&str>, n: u64) {
        self.counts
            .lock()
            .unwrap()
            .insert((billable.to_string(), scope.map(str::to_string)), n);
    }
}

#[async_trait]
impl LiveCount for PerBillableCount {
    async fn count(&self, billable: &BillableId, scope: Option<&CountScope>) -> Result<u64, StoreError> {
        let key = (billable.as_str().to_string(), scope.map(|s| s.as_str().to_string()));
        Ok(self.counts.lock().unwrap().get(&key).copied().unwrap_or(0))
    }
}
