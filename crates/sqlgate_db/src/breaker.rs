//! Circuit breaker.
//!
//! `Closed` counts consecutive failures inside a rolling window and trips to
//! `Open` at the threshold. `Open` rejects every call until `reopen_at`; the
//! first call after that becomes the single `HalfOpen` trial. A successful
//! trial closes the circuit, a failed one reopens it with a doubled cooldown
//! (capped at `backoff_cap`).
//!
//! All transitions happen under one mutex. Rejections while open are decided
//! from an atomic without taking the lock.

use crate::error::BreakerError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive failure threshold before tripping the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Longest the circuit ever stays open, whatever the configuration says.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// `[breaker]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub open_duration_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window_ms: 60_000,
            open_duration_ms: 5_000,
            backoff_cap_ms: 120_000,
        }
    }
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Cooldown after `reopens` consecutive failed trials.
    fn cooldown(&self, reopens: u32) -> Duration {
        let factor = 1u32.checked_shl(reopens.min(31)).unwrap_or(u32::MAX);
        self.open_duration()
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.backoff_cap().max(self.open_duration()))
            .min(MAX_COOLDOWN)
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { reopen_at: Instant },
    HalfOpen,
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window_started: Option<Instant>,
    reopens: u32,
    trial_in_flight: bool,
}

/// Shared breaker; wrap in `Arc` to use across tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    epoch: Instant,
    /// Milliseconds since `epoch` until which calls are rejected; 0 when not open.
    open_until_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed {
                    consecutive_failures: 0,
                },
                window_started: None,
                reopens: 0,
                trial_in_flight: false,
            }),
            epoch: Instant::now(),
            open_until_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Lock-free check: true while the circuit is open and the cooldown has not elapsed.
    pub fn is_open(&self) -> bool {
        let until = self.open_until_ms.load(Ordering::Acquire);
        until != 0 && self.millis_since_epoch(Instant::now()) < until
    }

    /// Run `f` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] without calling `f` when the circuit is
    /// open or a half-open trial is already running. Dropping the returned
    /// future mid-trial frees the trial slot.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut admission = self.admit().ok_or(BreakerError::Open)?;
        let result = f().await;
        match &result {
            Ok(_) => admission.succeeded(),
            Err(_) => admission.failed(),
        }
        result.map_err(BreakerError::Inner)
    }

    fn admit(&self) -> Option<Admission<'_>> {
        if self.is_open() {
            return None;
        }

        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed { .. } => Some(Admission::new(self, false)),
            CircuitState::Open { reopen_at } if now >= reopen_at => {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                self.open_until_ms.store(0, Ordering::Release);
                info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                Some(Admission::new(self, true))
            }
            CircuitState::Open { .. } => None,
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(Admission::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.reopens = 0;
            info!(breaker = %self.name, "Trial call succeeded, circuit closed");
        }
        if trial || matches!(inner.state, CircuitState::Closed { .. }) {
            inner.state = CircuitState::Closed {
                consecutive_failures: 0,
            };
            inner.window_started = None;
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.lock();

        if trial {
            inner.trial_in_flight = false;
            inner.reopens = inner.reopens.saturating_add(1);
            self.trip(&mut inner, now);
            return;
        }

        let CircuitState::Closed {
            consecutive_failures,
        } = inner.state
        else {
            // A call admitted before the circuit opened; already accounted for.
            return;
        };

        let in_window = inner
            .window_started
            .map(|start| now.duration_since(start) <= self.config.failure_window())
            .unwrap_or(false);
        let failures = if in_window {
            consecutive_failures + 1
        } else {
            inner.window_started = Some(now);
            1
        };
        debug!(breaker = %self.name, failures, "Recorded failure");

        if failures >= self.config.failure_threshold {
            self.trip(&mut inner, now);
        } else {
            inner.state = CircuitState::Closed {
                consecutive_failures: failures,
            };
        }
    }

    fn on_abandoned_trial(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
        debug!(breaker = %self.name, "Trial call cancelled, slot released");
    }

    fn trip(&self, inner: &mut MutexGuard<'_, Inner>, now: Instant) {
        let cooldown = self.config.cooldown(inner.reopens);
        // Unreachable with a clamped cooldown; a trial is then admitted at once.
        let reopen_at = now.checked_add(cooldown).unwrap_or(now);
        inner.state = CircuitState::Open { reopen_at };
        inner.window_started = None;
        self.open_until_ms
            .store(self.millis_since_epoch(reopen_at).max(1), Ordering::Release);
        warn!(
            breaker = %self.name,
            cooldown_ms = cooldown.as_millis() as u64,
            reopens = inner.reopens,
            "Circuit opened"
        );
    }

    fn millis_since_epoch(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An admitted call. Settles exactly once; an unsettled trial is released on drop.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeeded(&mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn failed(&mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_abandoned_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window_ms: 10_000,
            open_duration_ms: 1_000,
            backoff_cap_ms: 3_000,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[test]
    fn test_cooldown_doubles_up_to_cap() {
        let config = config();
        assert_eq!(config.cooldown(0), Duration::from_secs(1));
        assert_eq!(config.cooldown(1), Duration::from_secs(2));
        assert_eq!(config.cooldown(2), Duration::from_secs(3));
        assert_eq!(config.cooldown(40), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_cooldown_is_clamped() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 1,
                failure_window_ms: 60_000,
                open_duration_ms: u64::MAX,
                backoff_cap_ms: u64::MAX,
            },
        );
        assert_eq!(breaker.config.cooldown(0), MAX_COOLDOWN);
        assert_eq!(breaker.config.cooldown(31), MAX_COOLDOWN);

        assert!(fail(&breaker).await.is_err());
        assert!(breaker.is_open());

        tokio::time::advance(MAX_COOLDOWN - Duration::from_secs(1)).await;
        assert!(breaker.is_open());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(succeed(&breaker).await.is_ok());
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_skips_downstream() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner("boom"))));
        }
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));
        assert!(breaker.is_open());

        let calls = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", config());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        assert_eq!(
            breaker.state(),
            CircuitState::Closed {
                consecutive_failures: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_trip() {
        let breaker = CircuitBreaker::new("test", config());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(
            breaker.state(),
            CircuitState::Closed {
                consecutive_failures: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = Arc::new(CircuitBreaker::new("test", config()));
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<(), &'static str>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Second caller while the trial is running.
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(
            breaker.state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );
        succeed(&breaker).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_backoff() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));

        // Cooldown is now 2s.
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));
        tokio::time::advance(Duration::from_millis(600)).await;
        succeed(&breaker).await.unwrap();
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_the_slot() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let pending = breaker.call(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(
            breaker.state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );
    }
}
