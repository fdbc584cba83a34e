//! Per-host pools of reusable upstream connections.
//!
//! Each host has a bounded set of connections split between an idle stack (most recently used
//! at the top) and connections lent out to requests. A host's state sits behind one lock, and
//! waiters park on the host's [`Notify`] until a slot frees up.
//!
//! A borrowed [`Connection`] carries a lease on its slot. Handing it back through
//! [`ConnectionPool::release`] returns it to the idle stack or discards it; dropping it
//! anywhere else discards it and frees the slot.
use crate::client::{Connector, HostKey, HttpClient};
use crate::errors::{GatewayError, ProviderError, TimeoutStage};
use bon::Builder;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on idle plus in-use connections per host.
    #[builder(default = 32)]
    pub max_connections: usize,
    #[builder(default = 90_000)]
    pub idle_timeout_ms: u64,
    #[builder(default = 1000)]
    pub max_request_count_per_connection: u64,
    #[builder(default = 300_000)]
    pub max_connection_age_ms: u64,
    #[builder(default = 30_000)]
    pub sweep_interval_ms: u64,
    #[builder(default = 30_000)]
    pub probe_interval_ms: u64,
    /// Failure ratio above which a probe marks the host unhealthy.
    #[builder(default = 0.5)]
    pub unhealthy_failure_ratio: f64,
    #[builder(default = 5)]
    pub min_probe_samples: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PoolConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let positive = [
            ("max_connections", self.max_connections as u64),
            ("idle_timeout_ms", self.idle_timeout_ms),
            (
                "max_request_count_per_connection",
                self.max_request_count_per_connection,
            ),
            ("max_connection_age_ms", self.max_connection_age_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("probe_interval_ms", self.probe_interval_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(GatewayError::InvalidConfig(format!(
                "pool.{field} must be positive"
            )));
        }
        if !(0.0..=1.0).contains(&self.unhealthy_failure_ratio) {
            return Err(GatewayError::InvalidConfig(
                "pool.unhealthy_failure_ratio must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// A live transport to one host, owned by exactly one pool.
#[derive(Debug)]
pub struct Connection {
    host: HostKey,
    created_at: Instant,
    last_used: Instant,
    request_count: u64,
    healthy: bool,
    transport: Box<dyn HttpClient>,
    lease: Option<Lease>,
}

impl Connection {
    fn new(host: HostKey, transport: Box<dyn HttpClient>, lease: Lease) -> Self {
        let now = Instant::now();
        Self {
            host,
            created_at: now,
            last_used: now,
            request_count: 0,
            healthy: true,
            transport,
            lease: Some(lease),
        }
    }

    pub fn host(&self) -> &HostKey {
        &self.host
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && self.transport.is_open()
    }

    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub async fn send(
        &mut self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request_count += 1;
        self.last_used = Instant::now();
        let result = self.transport.request(req).await;
        if result.is_err() {
            self.healthy = false;
        }
        result
    }
}

/// Holds one in-use slot of a host; dropping an armed lease gives the slot back.
#[derive(Debug)]
struct Lease {
    pool: Arc<HostPool>,
    armed: bool,
}

impl Lease {
    fn new(pool: Arc<HostPool>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.pool.state.lock();
                state.in_use = state.in_use.saturating_sub(1);
                state.stats.evicted += 1;
            }
            self.pool.available.notify_one();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    pub host: String,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub evicted: u64,
    pub acquire_timeouts: u64,
    pub connect_failures: u64,
    pub avg_acquire_wait_ms: f64,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct Counters {
    created: u64,
    evicted: u64,
    acquire_timeouts: u64,
    connect_failures: u64,
    avg_acquire_wait_ms: Option<f64>,
    attempts_since_probe: u64,
    failures_since_probe: u64,
}

#[derive(Debug)]
struct HostState {
    idle: Vec<Connection>,
    in_use: usize,
    stats: Counters,
    healthy: bool,
}

#[derive(Debug)]
struct HostPool {
    key: HostKey,
    state: Mutex<HostState>,
    available: Notify,
}

/// The verdict of one probe over one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostHealth {
    pub host: HostKey,
    pub healthy: bool,
    pub failure_ratio: f64,
    pub samples: u64,
}

enum Step {
    Reuse(Connection),
    Connect,
    Wait,
}

#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    hosts: DashMap<HostKey, Arc<HostPool>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            hosts: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn host(&self, key: &HostKey) -> Arc<HostPool> {
        if let Some(pool) = self.hosts.get(key) {
            return Arc::clone(&pool);
        }
        let pool = self.hosts.entry(key.clone()).or_insert_with(|| {
            Arc::new(HostPool {
                key: key.clone(),
                state: Mutex::new(HostState {
                    idle: Vec::new(),
                    in_use: 0,
                    stats: Counters::default(),
                    healthy: true,
                }),
                available: Notify::new(),
            })
        });
        Arc::clone(&pool)
    }

    fn reusable(&self, conn: &Connection, now: Instant) -> bool {
        conn.is_healthy()
            && conn.request_count < self.config.max_request_count_per_connection
            && now.duration_since(conn.last_used) <= Duration::from_millis(self.config.idle_timeout_ms)
            && now.duration_since(conn.created_at)
                <= Duration::from_millis(self.config.max_connection_age_ms)
    }

    /// Borrow a connection to `host`, opening one if the host has spare capacity, otherwise
    /// waiting until `timeout` for another request to give one back.
    pub async fn acquire(
        &self,
        host: &HostKey,
        timeout: Duration,
    ) -> Result<Connection, ProviderError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let pool = self.host(host);

        loop {
            let notified = pool.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = pool.state.lock();
                let now = Instant::now();
                let mut step = None;
                while let Some(conn) = state.idle.pop() {
                    if self.reusable(&conn, now) {
                        state.in_use += 1;
                        step = Some(Step::Reuse(conn));
                        break;
                    }
                    state.stats.evicted += 1;
                }
                match step {
                    Some(step) => step,
                    None if state.idle.len() + state.in_use < self.config.max_connections => {
                        state.in_use += 1;
                        Step::Connect
                    }
                    None => Step::Wait,
                }
            };

            match step {
                Step::Reuse(mut conn) => {
                    conn.lease = Some(Lease::new(Arc::clone(&pool)));
                    self.record_wait(&pool, started);
                    return Ok(conn);
                }
                Step::Connect => {
                    let lease = Lease::new(Arc::clone(&pool));
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let connected =
                        tokio::time::timeout(remaining, self.connector.connect(host)).await;
                    let error = match connected {
                        Ok(Ok(transport)) => {
                            pool.state.lock().stats.created += 1;
                            self.record_wait(&pool, started);
                            debug!(%host, "Created pooled connection");
                            metrics::counter!("pool_connections_created_total", "host" => host.to_string())
                                .increment(1);
                            return Ok(Connection::new(host.clone(), transport, lease));
                        }
                        Ok(Err(e)) => e,
                        Err(_) => ProviderError::Timeout {
                            stage: TimeoutStage::Connect,
                            elapsed: started.elapsed(),
                        },
                    };
                    {
                        let mut state = pool.state.lock();
                        state.in_use -= 1;
                        state.stats.connect_failures += 1;
                        state.stats.attempts_since_probe += 1;
                        state.stats.failures_since_probe += 1;
                    }
                    lease.disarm();
                    pool.available.notify_one();
                    warn!(%host, "Failed to open upstream connection: {}", error);
                    return Err(error);
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        pool.state.lock().stats.acquire_timeouts += 1;
                        metrics::counter!("pool_acquire_timeouts_total", "host" => host.to_string())
                            .increment(1);
                        return Err(ProviderError::Timeout {
                            stage: TimeoutStage::Acquire,
                            elapsed: started.elapsed(),
                        });
                    }
                }
            }
        }
    }

    fn record_wait(&self, pool: &HostPool, started: Instant) {
        let waited = started.elapsed().as_secs_f64() * 1000.0;
        let mut state = pool.state.lock();
        state.stats.avg_acquire_wait_ms = Some(match state.stats.avg_acquire_wait_ms {
            Some(avg) => EMA_ALPHA * waited + (1.0 - EMA_ALPHA) * avg,
            None => waited,
        });
    }

    /// Give a connection back. Unhealthy connections, and those past their request ceiling or
    /// age, are discarded instead of being kept idle.
    pub fn release(&self, mut conn: Connection, healthy: bool) {
        let Some(lease) = conn.lease.take() else {
            return;
        };
        let pool = Arc::clone(&lease.pool);
        if !healthy {
            conn.mark_unhealthy();
        }
        let now = Instant::now();
        conn.last_used = now;
        let keep = self.reusable(&conn, now);
        {
            let mut state = pool.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.stats.attempts_since_probe += 1;
            if !healthy {
                state.stats.failures_since_probe += 1;
            }
            if keep {
                state.idle.push(conn);
            } else {
                state.stats.evicted += 1;
                debug!(host = %pool.key, "Discarding connection on release");
            }
        }
        lease.disarm();
        pool.available.notify_one();
    }

    /// Evict idle connections past the idle timeout, request ceiling or maximum age.
    /// Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for entry in self.hosts.iter() {
            let pool = entry.value();
            let mut state = pool.state.lock();
            let before = state.idle.len();
            state.idle.retain(|conn| self.reusable(conn, now));
            let removed = before - state.idle.len();
            state.stats.evicted += removed as u64;
            evicted += removed;
            if removed > 0 {
                pool.available.notify_waiters();
            }
        }
        if evicted > 0 {
            debug!(evicted, "Swept idle connections");
        }
        evicted
    }

    /// Judge every host on the outcomes seen since the previous probe, then reset the counts.
    pub fn probe(&self) -> Vec<HostHealth> {
        let mut verdicts = Vec::with_capacity(self.hosts.len());
        for entry in self.hosts.iter() {
            let pool = entry.value();
            let mut state = pool.state.lock();
            let samples = state.stats.attempts_since_probe;
            let failure_ratio = if samples == 0 {
                0.0
            } else {
                state.stats.failures_since_probe as f64 / samples as f64
            };
            let healthy = !(samples >= self.config.min_probe_samples
                && failure_ratio > self.config.unhealthy_failure_ratio);
            if !healthy && state.healthy {
                warn!(host = %pool.key, failure_ratio, samples, "Host marked unhealthy");
            } else if healthy && !state.healthy {
                debug!(host = %pool.key, "Host healthy again");
            }
            state.healthy = healthy;
            state.stats.attempts_since_probe = 0;
            state.stats.failures_since_probe = 0;
            verdicts.push(HostHealth {
                host: pool.key.clone(),
                healthy,
                failure_ratio,
                samples,
            });
        }
        verdicts
    }

    pub fn stats(&self) -> Vec<HostStats> {
        let mut stats: Vec<HostStats> = self
            .hosts
            .iter()
            .map(|entry| {
                let state = entry.value().state.lock();
                HostStats {
                    host: entry.key().to_string(),
                    idle: state.idle.len(),
                    in_use: state.in_use,
                    created: state.stats.created,
                    evicted: state.stats.evicted,
                    acquire_timeouts: state.stats.acquire_timeouts,
                    connect_failures: state.stats.connect_failures,
                    avg_acquire_wait_ms: state.stats.avg_acquire_wait_ms.unwrap_or(0.0),
                    healthy: state.healthy,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.host.cmp(&b.host));
        stats
    }

    pub fn host_stats(&self, host: &HostKey) -> Option<HostStats> {
        let key = host.to_string();
        self.stats().into_iter().find(|s| s.host == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockConnector;

    fn host() -> HostKey {
        HostKey::from_url(&"https://primary.test/v1".parse().unwrap()).unwrap()
    }

    fn pool(connector: &MockConnector, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(config, Arc::new(connector.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_most_recently_released_connection() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default());

        let first = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        let second = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects(), 2);
        pool.release(first, true);
        pool.release(second, true);

        let stats = pool.host_stats(&host()).unwrap();
        assert_eq!((stats.idle, stats.in_use), (2, 0));

        let _again = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects(), 2);
        let stats = pool.host_stats(&host()).unwrap();
        assert_eq!((stats.idle, stats.in_use), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_beyond_bound_waits_then_times_out() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::builder().max_connections(2).build());

        let _a = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        let _b = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let err = pool
            .acquire(&host(), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Timeout {
                stage: TimeoutStage::Acquire,
                ..
            }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(3));

        let stats = pool.host_stats(&host()).unwrap();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.acquire_timeouts, 1);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_released_connection() {
        let connector = MockConnector::new();
        let pool = Arc::new(pool(&connector, PoolConfig::builder().max_connections(1).build()));

        let held = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&host(), Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiter.is_finished());

        pool.release(held, true);
        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.host(), &host());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_frees_its_slot() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::builder().max_connections(1).build());

        let conn = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        drop(conn);
        let stats = pool.host_stats(&host()).unwrap();
        assert_eq!((stats.idle, stats.in_use), (0, 0));

        pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_release_discards_connection() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default());

        let conn = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        pool.release(conn, false);
        let stats = pool.host_stats(&host()).unwrap();
        assert_eq!((stats.idle, stats.in_use, stats.evicted), (0, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_frees_slot() {
        let connector = MockConnector::new();
        connector.refuse_connections("primary.test");
        let pool = pool(&connector, PoolConfig::builder().max_connections(1).build());

        for _ in 0..3 {
            let err = pool
                .acquire(&host(), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderError::Connection(_)));
        }
        let stats = pool.host_stats(&host()).unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.connect_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_and_aged_connections() {
        let connector = MockConnector::new();
        let pool = pool(
            &connector,
            PoolConfig::builder()
                .idle_timeout_ms(10_000)
                .max_connection_age_ms(60_000)
                .build(),
        );

        let a = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        pool.release(a, true);
        tokio::time::advance(Duration::from_secs(8)).await;
        pool.release(b, true);
        tokio::time::advance(Duration::from_secs(5)).await;

        // `a` has idled 13s, `b` only 5s.
        assert_eq!(pool.sweep(), 1);
        assert_eq!(pool.host_stats(&host()).unwrap().idle, 1);

        // Keep `b` fresh until it outlives the maximum age.
        for _ in 0..6 {
            let conn = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
            tokio::time::advance(Duration::from_secs(9)).await;
            pool.release(conn, true);
        }
        assert_eq!(pool.host_stats(&host()).unwrap().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_ceiling_retires_connection() {
        let connector = MockConnector::new();
        let pool = pool(
            &connector,
            PoolConfig::builder()
                .max_request_count_per_connection(2)
                .build(),
        );

        for _ in 0..2 {
            let mut conn = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
            conn.send(crate::test_utils::post_json("/v1/chat/completions", "{}"))
                .await
                .unwrap();
            pool.release(conn, true);
        }
        assert_eq!(pool.host_stats(&host()).unwrap().idle, 0);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_marks_failing_host_and_resets() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::builder().min_probe_samples(4).build());

        for healthy in [false, false, false, true] {
            let conn = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
            pool.release(conn, healthy);
        }
        let verdicts = pool.probe();
        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].healthy);
        assert_eq!(verdicts[0].samples, 4);
        assert_eq!(verdicts[0].failure_ratio, 0.75);

        let verdicts = pool.probe();
        assert!(verdicts[0].healthy);
        assert_eq!(verdicts[0].samples, 0);
    }

    #[tokio::test]
    async fn test_host_verdict_serializes_host_as_text() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default());
        let conn = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        pool.release(conn, true);

        let verdict = serde_json::to_value(&pool.probe()[0]).unwrap();
        assert_eq!(verdict["host"], "https://primary.test:443");
        assert_eq!(verdict["healthy"], true);
    }
}
