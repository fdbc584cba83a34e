//! Per-provider circuit breakers.
//!
//! ```text
//! CLOSED    --failure_threshold consecutive failures-->  OPEN
//! OPEN      --recovery_timeout elapsed (on next check)-> HALF_OPEN
//! HALF_OPEN --success_threshold consecutive successes--> CLOSED
//! HALF_OPEN --any failure-->                             OPEN (timer restarts)
//! ```
use crate::errors::GatewayError;
use bon::Builder;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[builder(default = 5)]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    #[builder(default = 60_000)]
    pub recovery_timeout_ms: u64,
    /// Consecutive trial successes that close the circuit again.
    #[builder(default = 2)]
    pub success_threshold: u32,
    /// Trials allowed in flight at once while half-open.
    #[builder(default = 1)]
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        for (field, value) in [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("half_open_max_requests", self.half_open_max_requests),
        ] {
            if value == 0 {
                return Err(GatewayError::InvalidConfig(format!(
                    "breaker.{field} must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trials_in_flight: u32,
    /// Bumped on every transition; a trial permit only counts against the half-open period
    /// that issued it.
    generation: u64,
    last_transition: Instant,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Leave to make one attempt through a breaker.
///
/// Settle it with [`BreakerPermit::record_success`] or [`BreakerPermit::record_failure`]. A
/// permit dropped unsettled, because the caller went away mid-attempt, hands its half-open trial
/// slot back without recording an outcome.
#[must_use = "an unsettled permit records no outcome"]
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: Option<u64>,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit holds a half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.finish(true, self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.finish(false, self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(generation) = self.trial {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == generation {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                debug!(provider = %self.breaker.name, "Abandoned half-open trial released");
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                trials_in_flight: 0,
                generation: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Current state, without applying the lazy OPEN to HALF_OPEN transition.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Half-open trials currently holding a slot.
    pub fn trials_in_flight(&self) -> u32 {
        self.inner.lock().trials_in_flight
    }

    /// Ask to make an attempt now. While half-open the permit claims one of the trial slots.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            BreakerState::Closed => None,
            BreakerState::Open => {
                if inner.last_transition.elapsed() < self.config.recovery_timeout() {
                    return None;
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.trials_in_flight = 1;
                Some(inner.generation)
            }
            BreakerState::HalfOpen => {
                if inner.trials_in_flight >= self.config.half_open_max_requests {
                    return None;
                }
                inner.trials_in_flight += 1;
                Some(inner.generation)
            }
        };
        Some(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    /// Record a success observed outside a permit, such as a manual probe.
    pub fn record_success(&self) {
        self.finish(true, None);
    }

    /// Record a failure observed outside a permit.
    pub fn record_failure(&self) {
        self.finish(false, None);
    }

    fn finish(&self, success: bool, trial: Option<u64>) {
        let mut inner = self.inner.lock();
        if trial.is_some_and(|generation| generation == inner.generation) {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        if success {
            match inner.state {
                BreakerState::Closed => inner.consecutive_failures = 0,
                BreakerState::HalfOpen => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        self.transition(&mut inner, BreakerState::Closed);
                    }
                }
                // A straggler that was admitted before the circuit opened; it proves nothing.
                BreakerState::Open => {}
            }
            return;
        }
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open),
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Instant::now();
        inner.consecutive_successes = 0;
        inner.trials_in_flight = 0;
        inner.generation += 1;
        if to == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }

        match to {
            BreakerState::Open => warn!(
                provider = %self.name,
                %from,
                failures = inner.consecutive_failures,
                "Circuit opened"
            ),
            _ => info!(provider = %self.name, %from, %to, "Circuit state changed"),
        }
        metrics::counter!(
            "breaker_transitions_total",
            "provider" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

/// Breakers for every provider, created on first use and kept across config reloads.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider) {
            return Arc::clone(&breaker);
        }
        let breaker = self
            .breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.config.clone())));
        Arc::clone(&breaker)
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        self.breakers
            .get(provider)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Forget providers that no longer exist.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.breakers.retain(|name, _| {
            let kept = keep(name);
            if !kept {
                debug!(provider = %name, "Dropping circuit breaker");
            }
            kept
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "primary",
            BreakerConfig::builder()
                .failure_threshold(3)
                .recovery_timeout_ms(60_000)
                .success_threshold(2)
                .build(),
        ))
    }

    fn open(breaker: &CircuitBreaker) {
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_stays_open_until_recovery() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.try_acquire().unwrap().record_failure();
        }
        assert!(breaker.try_acquire().is_some());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        for _ in 0..1000 {
            assert!(breaker.try_acquire().is_none());
        }
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let permit = breaker.try_acquire().unwrap();
        assert!(permit.is_trial());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trials_and_closes_after_successes() {
        let breaker = breaker();
        open(&breaker);
        tokio::time::advance(Duration::from_secs(60)).await;

        let trial = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_none(), "only one trial may be in flight");
        trial.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.try_acquire().unwrap().record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timer() {
        let breaker = breaker();
        open(&breaker);
        tokio::time::advance(Duration::from_secs(60)).await;
        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire().is_none());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_gives_its_slot_back() {
        let breaker = breaker();
        open(&breaker);
        tokio::time::advance(Duration::from_secs(60)).await;

        let trial = breaker.try_acquire().unwrap();
        assert_eq!(breaker.trials_in_flight(), 1);
        drop(trial);
        assert_eq!(breaker.trials_in_flight(), 0);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.try_acquire().unwrap().record_success();
        breaker.try_acquire().unwrap().record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_does_not_free_a_later_slot() {
        let breaker = Arc::new(CircuitBreaker::new(
            "primary",
            BreakerConfig::builder()
                .failure_threshold(1)
                .half_open_max_requests(2)
                .build(),
        ));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let stale = breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap().record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let _current = breaker.try_acquire().unwrap();
        drop(stale);
        assert_eq!(breaker.trials_in_flight(), 1);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_registry_keeps_state_per_provider() {
        let breakers = CircuitBreakers::new(BreakerConfig::builder().failure_threshold(1).build());
        breakers.get("a").record_failure();
        assert_eq!(breakers.state("a"), BreakerState::Open);
        assert_eq!(breakers.state("b"), BreakerState::Closed);

        breakers.retain(|name| name != "a");
        assert_eq!(breakers.state("a"), BreakerState::Closed);
    }
}
