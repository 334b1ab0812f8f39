//! Bounded retry for counter upserts.
//!
//! Only the counter-upsert race is retried inside the core; a full evaluation is
//! never retried. Delays use full jitter over an exponential ceiling so racing
//! writers spread out.

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Attempts made by [`UpsertRetry::default`].
pub const DEFAULT_UPSERT_ATTEMPTS: usize = 3;

/// Base delay used by [`UpsertRetry::default`].
pub const DEFAULT_UPSERT_DELAY: Duration = Duration::from_millis(5);

/// Abstraction for sleeping between attempts, so tests never wait.
pub trait Sleeper: Send + Sync + fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that returns immediately and records requested delays.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().expect("sleeper poisoned").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().expect("sleeper poisoned").push(duration);
        Box::pin(async {})
    }
}

/// Retry budget for counter upserts.
#[derive(Clone, Debug)]
pub struct UpsertRetry {
    max_attempts: usize,
    base_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for UpsertRetry {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_UPSERT_ATTEMPTS,
            base_delay: DEFAULT_UPSERT_DELAY,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl UpsertRetry {
    /// `max_attempts` counts the first try; must be > 0.
    pub fn new(max_attempts: usize, base_delay: Duration) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        Ok(Self { max_attempts, base_delay, ..Self::default() })
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Jittered delay before retry number `retry` (1-indexed).
    pub fn delay_for(&self, retry: usize) -> Duration {
        let exp = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        let ceiling = self.base_delay.saturating_mul(1u32 << exp);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng().random_range(0..=millis))
    }

    pub(crate) async fn pause(&self, retry: usize) {
        let delay = self.delay_for(retry);
        self.sleeper.sleep(delay).await;
    }
}
