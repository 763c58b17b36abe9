//! # Clock: time source and delay scheduler
//!
//! ## Responsibility
//! Provide the single source of "now" and of artificial delays (batch
//! windows, retry backoff, per-call deadlines) for every component.
//!
//! ## Guarantees
//! - [`TokioClock`] uses the wall clock and `tokio::time::sleep`
//! - [`ManualClock`] never waits: `sleep` advances its virtual time and
//!   yields once, so tests are deterministic and fast
//! - Every requested delay is recorded by [`ManualClock`] for assertions
//!
//! ## NOT Responsible For
//! - Deciding how long to wait (that belongs to the callers)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Time source and delay scheduler injected into every component.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests.
///
/// `sleep` advances the virtual time by the requested amount, records the
/// delay, and yields to the scheduler once instead of waiting.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now: start,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Move the virtual time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock();
        state.now += to_chrono(by);
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        self.inner.lock().now = at;
    }

    /// Every delay requested through [`Clock::sleep`], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.inner.lock();
            state.now += to_chrono(duration);
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Convert a std duration to a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
