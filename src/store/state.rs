use super::StateKey;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lock wait applied by [`InMemoryStateStore::new`].
pub const DEFAULT_LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Parameters frozen when an exceed episode starts, plus per-window warning bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    /// Grace length captured at exceed time so config changes don't move an in-flight deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_seconds: Option<i64>,
    /// Thresholds already announced in the current window (per-period limits only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warned_thresholds: Vec<f64>,
}

/// Stored enforcement fields for one (billable, limit) pair.
///
/// `ok`, `warning`, `grace` and `blocked` are derived from these fields; no state
/// enum is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnforcementState {
    pub exceeded_at: Option<DateTime<Utc>>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub last_warn_threshold: Option<f64>,
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: StateData,
}

impl EnforcementState {
    /// Clear every field.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// End the current exceed episode, keeping warning history.
    pub fn clear_episode(&mut self) {
        self.exceeded_at = None;
        self.blocked_at = None;
        self.data.grace_seconds = None;
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded_at.is_some()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_at.is_some()
    }

    /// Grace deadline of the current episode.
    ///
    /// `None` when no episode is running, or when the frozen grace length is
    /// missing or does not fit the calendar; callers treat the latter two as
    /// already expired.
    pub fn grace_ends_at(&self) -> Option<DateTime<Utc>> {
        let exceeded_at = self.exceeded_at?;
        let grace = Duration::try_seconds(self.data.grace_seconds?)?;
        exceeded_at.checked_add_signed(grace)
    }

    /// True when this row belongs to a window other than `current`.
    pub fn is_stale_for(&self, current: DateTime<Utc>) -> bool {
        matches!(self.window_start, Some(start) if start != current)
    }
}

/// An exclusively held row lock.
///
/// The row is released when the guard is dropped. Changes made through
/// [`state`](Self::state) are only persisted by [`save`](Self::save).
#[async_trait]
pub trait StateGuard: Send {
    /// Working copy of the locked row.
    fn state(&mut self) -> &mut EnforcementState;

    /// Persist the working copy. The lock stays held until drop.
    async fn save(&mut self) -> Result<(), StoreError>;
}

/// Row-locked access to enforcement state.
#[async_trait]
pub trait StateStore: Send + Sync {
    type Guard: StateGuard + 'static;

    /// Lock the row for `key`, waiting at most the backend's lock timeout.
    ///
    /// An absent row is presented as [`EnforcementState::default`] and is only
    /// written if something other than the default is saved.
    async fn lock(&self, key: &StateKey) -> Result<Self::Guard, StoreError>;

    /// Lock-free read of the last committed row; may be slightly stale.
    async fn peek(&self, key: &StateKey) -> Result<Option<EnforcementState>, StoreError>;

    /// Lock the row, hand it to `f`, persist the result and release the lock.
    async fn with_lock<F, T>(&self, key: &StateKey, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut EnforcementState) -> T + Send,
        T: Send,
    {
        let mut guard = self.lock(key).await?;
        let out = f(guard.state());
        guard.save().await?;
        Ok(out)
    }

    /// Clear every field of the row under lock. The row itself is kept.
    async fn reset(&self, key: &StateKey) -> Result<(), StoreError> {
        self.with_lock(key, EnforcementState::clear).await
    }
}

/// In-memory state store with per-row async locks and bounded lock wait.
#[derive(Clone, Debug)]
pub struct InMemoryStateStore {
    locks: Arc<Mutex<HashMap<StateKey, Arc<tokio::sync::Mutex<()>>>>>,
    rows: Arc<Mutex<HashMap<StateKey, EnforcementState>>>,
    lock_timeout: std::time::Duration,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: std::time::Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            rows: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout,
        }
    }

    /// Number of persisted rows.
    pub fn len(&self) -> usize {
        self.rows.lock().expect("state store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row_lock(&self, key: &StateKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("state store poisoned");
        locks.entry(key.clone()).or_default().clone()
    }
}

/// Guard returned by [`InMemoryStateStore::lock`].
#[derive(Debug)]
pub struct InMemoryStateGuard {
    _held: tokio::sync::OwnedMutexGuard<()>,
    rows: Arc<Mutex<HashMap<StateKey, EnforcementState>>>,
    key: StateKey,
    working: EnforcementState,
    existed: bool,
}

#[async_trait]
impl StateGuard for InMemoryStateGuard {
    fn state(&mut self) -> &mut EnforcementState {
        &mut self.working
    }

    async fn save(&mut self) -> Result<(), StoreError> {
        if self.existed || self.working != EnforcementState::default() {
            self.rows
                .lock()
                .expect("state store poisoned")
                .insert(self.key.clone(), self.working.clone());
            self.existed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    type Guard = InMemoryStateGuard;

    async fn lock(&self, key: &StateKey) -> Result<InMemoryStateGuard, StoreError> {
        let held = tokio::time::timeout(self.lock_timeout, self.row_lock(key).lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout {
                key: key.to_string(),
                waited: self.lock_timeout,
            })?;

        let existing = self.rows.lock().expect("state store poisoned").get(key).cloned();
        Ok(InMemoryStateGuard {
            _held: held,
            rows: self.rows.clone(),
            key: key.clone(),
            existed: existing.is_some(),
            working: existing.unwrap_or_default(),
        })
    }

    async fn peek(&self, key: &StateKey) -> Result<Option<EnforcementState>, StoreError> {
        Ok(self.rows.lock().expect("state store poisoned").get(key).cloned())
    }
}
