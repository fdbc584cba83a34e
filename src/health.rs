//! Rolling per-provider health statistics and their classification.
//!
//! Classification is advisory: the routing engine uses it to order candidates, never to refuse
//! an attempt. Only the circuit breaker can stop traffic to a provider.
use crate::circuit_breaker::BreakerState;
use crate::errors::GatewayError;
use bon::Builder;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct HealthConfig {
    /// Outcomes older than this fall out of the window.
    #[builder(default = 300_000)]
    pub window_ms: u64,
    #[builder(default = 1000)]
    pub max_samples: usize,
    /// Below this many outcomes the success-rate tests are waived.
    #[builder(default = 10)]
    pub min_samples: usize,
    #[builder(default = 0.95)]
    pub healthy_success_rate: f64,
    #[builder(default = 0.5)]
    pub unhealthy_success_rate: f64,
    /// p95 latency above this keeps a provider out of `healthy`.
    #[builder(default = 10_000)]
    pub latency_slo_ms: u64,
    /// Cooldown applied after a rate limit that carried no retry-after hint.
    #[builder(default = 60_000)]
    pub default_cooldown_ms: u64,
    /// Longest cooldown any hint can impose.
    #[builder(default = 3_600_000)]
    pub max_cooldown_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |reason: &str| Err(GatewayError::InvalidConfig(format!("health.{reason}")));
        if self.window_ms == 0 || self.max_samples == 0 {
            return invalid("window_ms and max_samples must be positive");
        }
        let rates = 0.0..=1.0;
        if !rates.contains(&self.healthy_success_rate)
            || !rates.contains(&self.unhealthy_success_rate)
            || self.unhealthy_success_rate > self.healthy_success_rate
        {
            return invalid("success rates must satisfy 0 <= unhealthy <= healthy <= 1");
        }
        if self.max_cooldown_ms == 0 {
            return invalid("max_cooldown_ms must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Classification {
    /// Sort key for candidate ordering; lower is preferred.
    pub fn rank(&self) -> u8 {
        match self {
            Classification::Healthy => 0,
            Classification::Degraded => 1,
            Classification::Unhealthy => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Healthy => "healthy",
            Classification::Degraded => "degraded",
            Classification::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub ema_latency_ms: Option<f64>,
    pub last_success_secs_ago: Option<f64>,
    pub last_failure_secs_ago: Option<f64>,
    /// Remaining rate-limit cooldown, if one is active
    pub cooldown_remaining_ms: Option<u64>,
    pub pool_healthy: bool,
    pub breaker: BreakerState,
    pub classification: Classification,
}

#[derive(Debug)]
struct Sample {
    at: Instant,
    success: bool,
    latency: Duration,
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<Sample>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    ema_latency_ms: Option<f64>,
    cooldown_until: Option<Instant>,
    pool_healthy: bool,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            last_success: None,
            last_failure: None,
            ema_latency_ms: None,
            cooldown_until: None,
            pool_healthy: true,
        }
    }
}

impl Window {
    fn prune(&mut self, config: &HealthConfig, now: Instant) {
        let horizon = Duration::from_millis(config.window_ms);
        while self
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.at) > horizon)
        {
            self.samples.pop_front();
        }
        while self.samples.len() > config.max_samples {
            self.samples.pop_front();
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Zero-based position of the nearest-rank `p`th percentile among `len` values.
fn rank_index(len: usize, p: f64) -> usize {
    let rank = ((p / 100.0) * len as f64).ceil() as usize;
    rank.clamp(1, len) - 1
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    Some(sorted[rank_index(sorted.len(), p)])
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    fn window(&self, provider: &str) -> Arc<Mutex<Window>> {
        if let Some(window) = self.windows.get(provider) {
            return Arc::clone(&window);
        }
        Arc::clone(&self.windows.entry(provider.to_string()).or_default())
    }

    fn record(&self, provider: &str, success: bool, latency: Duration) {
        let window = self.window(provider);
        let mut window = window.lock();
        let now = Instant::now();
        window.samples.push_back(Sample {
            at: now,
            success,
            latency,
        });
        if success {
            window.last_success = Some(now);
        } else {
            window.last_failure = Some(now);
        }
        let ms = latency.as_secs_f64() * 1000.0;
        window.ema_latency_ms = Some(match window.ema_latency_ms {
            Some(ema) => EMA_ALPHA * ms + (1.0 - EMA_ALPHA) * ema,
            None => ms,
        });
        window.prune(&self.config, now);
    }

    pub fn record_success(&self, provider: &str, latency: Duration) {
        self.record(provider, true, latency);
    }

    pub fn record_failure(&self, provider: &str, latency: Duration) {
        self.record(provider, false, latency);
    }

    /// Start a rate-limit cooldown, using the provider's hint when it sent one.
    pub fn record_rate_limit(&self, provider: &str, retry_after: Option<Duration>) {
        let cap = Duration::from_millis(self.config.max_cooldown_ms);
        let cooldown = retry_after
            .unwrap_or_else(|| Duration::from_millis(self.config.default_cooldown_ms))
            .min(cap);
        debug!(provider, cooldown_ms = cooldown.as_millis() as u64, "Rate-limit cooldown started");
        let now = Instant::now();
        let until = now.checked_add(cooldown).or_else(|| now.checked_add(cap)).unwrap_or(now);
        self.window(provider).lock().cooldown_until = Some(until);
    }

    pub fn in_cooldown(&self, provider: &str) -> bool {
        self.windows
            .get(provider)
            .is_some_and(|w| w.lock().in_cooldown(Instant::now()))
    }

    /// Apply the connection pool's verdict for the provider's host.
    pub fn set_pool_health(&self, provider: &str, healthy: bool) {
        self.window(provider).lock().pool_healthy = healthy;
    }

    pub fn snapshot(&self, provider: &str, breaker: BreakerState) -> HealthSnapshot {
        let window = self.window(provider);
        let mut window = window.lock();
        let now = Instant::now();
        window.prune(&self.config, now);

        let total = window.samples.len();
        let successes = window.samples.iter().filter(|s| s.success).count();
        let success_rate = if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        };
        let mut latencies: Vec<f64> = window
            .samples
            .iter()
            .map(|s| s.latency.as_secs_f64() * 1000.0)
            .collect();
        latencies.sort_by(f64::total_cmp);
        let p95_ms = percentile(&latencies, 95.0);
        let cooling = window.in_cooldown(now);

        let classification = self.classify(
            breaker,
            total,
            success_rate,
            p95_ms,
            window.pool_healthy,
            cooling,
        );

        HealthSnapshot {
            provider: provider.to_string(),
            total,
            successes,
            failures: total - successes,
            success_rate,
            p50_ms: percentile(&latencies, 50.0),
            p95_ms,
            p99_ms: percentile(&latencies, 99.0),
            ema_latency_ms: window.ema_latency_ms,
            last_success_secs_ago: window
                .last_success
                .map(|t| now.duration_since(t).as_secs_f64()),
            last_failure_secs_ago: window
                .last_failure
                .map(|t| now.duration_since(t).as_secs_f64()),
            cooldown_remaining_ms: window
                .cooldown_until
                .filter(|_| cooling)
                .map(|until| until.duration_since(now).as_millis() as u64),
            pool_healthy: window.pool_healthy,
            breaker,
            classification,
        }
    }

    /// The classification alone. Used on the request path, so it selects p95 instead of
    /// sorting the window and leaves unknown providers without a window.
    pub fn classification(&self, provider: &str, breaker: BreakerState) -> Classification {
        let Some(window) = self.windows.get(provider).map(|w| Arc::clone(&w)) else {
            return self.classify(breaker, 0, 1.0, None, true, false);
        };
        let mut window = window.lock();
        let now = Instant::now();
        window.prune(&self.config, now);

        let total = window.samples.len();
        let successes = window.samples.iter().filter(|s| s.success).count();
        let success_rate = if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        };
        let p95_ms = if total == 0 {
            None
        } else {
            let mut latencies: Vec<f64> = window
                .samples
                .iter()
                .map(|s| s.latency.as_secs_f64() * 1000.0)
                .collect();
            let (_, p95, _) =
                latencies.select_nth_unstable_by(rank_index(total, 95.0), f64::total_cmp);
            Some(*p95)
        };
        self.classify(
            breaker,
            total,
            success_rate,
            p95_ms,
            window.pool_healthy,
            window.in_cooldown(now),
        )
    }

    fn classify(
        &self,
        breaker: BreakerState,
        total: usize,
        success_rate: f64,
        p95_ms: Option<f64>,
        pool_healthy: bool,
        cooling: bool,
    ) -> Classification {
        let enough = total >= self.config.min_samples;
        if breaker == BreakerState::Open
            || (enough && success_rate < self.config.unhealthy_success_rate)
        {
            return Classification::Unhealthy;
        }
        let rate_ok = !enough || success_rate >= self.config.healthy_success_rate;
        let latency_ok = p95_ms.is_none_or(|p95| p95 <= self.config.latency_slo_ms as f64);
        if breaker == BreakerState::Closed && rate_ok && latency_ok && pool_healthy && !cooling {
            Classification::Healthy
        } else {
            Classification::Degraded
        }
    }

    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.windows.retain(|name, _| keep(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            HealthConfig::builder()
                .min_samples(4)
                .latency_slo_ms(500)
                .window_ms(60_000)
                .build(),
        )
    }

    #[test]
    fn test_percentiles_use_nearest_rank() {
        let latencies: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&latencies, 50.0), Some(50.0));
        assert_eq!(percentile(&latencies, 95.0), Some(95.0));
        assert_eq!(percentile(&latencies, 99.0), Some(99.0));
        assert_eq!(percentile(&[7.0], 99.0), Some(7.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classification_follows_success_rate() {
        let health = monitor();
        for _ in 0..3 {
            health.record_failure("p", Duration::from_millis(10));
        }
        // Too few samples to judge the rate.
        assert_eq!(
            health.classification("p", BreakerState::Closed),
            Classification::Healthy
        );

        health.record_success("p", Duration::from_millis(10));
        assert_eq!(
            health.classification("p", BreakerState::Closed),
            Classification::Unhealthy
        );

        for _ in 0..4 {
            health.record_success("p", Duration::from_millis(10));
        }
        // 5 of 8 succeeded: between the two thresholds.
        assert_eq!(
            health.classification("p", BreakerState::Closed),
            Classification::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_state_overrides_statistics() {
        let health = monitor();
        for _ in 0..10 {
            health.record_success("p", Duration::from_millis(10));
        }
        assert_eq!(
            health.classification("p", BreakerState::Open),
            Classification::Unhealthy
        );
        assert_eq!(
            health.classification("p", BreakerState::HalfOpen),
            Classification::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_is_degraded() {
        let health = monitor();
        for _ in 0..10 {
            health.record_success("p", Duration::from_millis(900));
        }
        let snapshot = health.snapshot("p", BreakerState::Closed);
        assert_eq!(snapshot.p95_ms, Some(900.0));
        assert_eq!(snapshot.classification, Classification::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_and_pool_verdict_degrade() {
        let health = monitor();
        health.record_rate_limit("p", Some(Duration::from_secs(5)));
        assert!(health.in_cooldown("p"));
        let snapshot = health.snapshot("p", BreakerState::Closed);
        assert_eq!(snapshot.classification, Classification::Degraded);
        assert_eq!(snapshot.cooldown_remaining_ms, Some(5000));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!health.in_cooldown("p"));
        assert_eq!(
            health.classification("p", BreakerState::Closed),
            Classification::Healthy
        );

        health.set_pool_health("p", false);
        assert_eq!(
            health.classification("p", BreakerState::Closed),
            Classification::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_classification_agrees_with_snapshot() {
        let health = monitor();
        assert_eq!(
            health.classification("unknown", BreakerState::Closed),
            Classification::Healthy
        );
        for ms in [900, 20, 450, 30, 610, 10, 80, 40, 70, 60, 15, 25] {
            health.record_success("p", Duration::from_millis(ms));
            for breaker in [BreakerState::Closed, BreakerState::HalfOpen] {
                assert_eq!(
                    health.classification("p", breaker),
                    health.snapshot("p", breaker).classification,
                    "after {ms}ms"
                );
            }
        }
        assert_eq!(
            health.classification("p", BreakerState::Closed),
            Classification::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_cooldown_hint_is_capped() {
        let health = HealthMonitor::new(HealthConfig::builder().max_cooldown_ms(10_000).build());
        health.record_rate_limit("p", Some(Duration::MAX));
        assert_eq!(
            health
                .snapshot("p", BreakerState::Closed)
                .cooldown_remaining_ms,
            Some(10_000)
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!health.in_cooldown("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires_old_outcomes() {
        let health = monitor();
        for _ in 0..10 {
            health.record_failure("p", Duration::from_millis(10));
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        let snapshot = health.snapshot("p", BreakerState::Closed);
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.classification, Classification::Healthy);
        assert!(snapshot.last_failure_secs_ago.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ema_latency() {
        let health = monitor();
        health.record_success("p", Duration::from_millis(100));
        health.record_success("p", Duration::from_millis(200));
        let ema = health
            .snapshot("p", BreakerState::Closed)
            .ema_latency_ms
            .unwrap();
        assert!((ema - 110.0).abs() < 1e-9);
    }
}
