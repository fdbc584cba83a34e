//! The service bundle wiring every component together.
//!
//! A [`Gateway`] is built once in `main` (or in a test) and handed to the HTTP layer as state.
//! It owns the supervisor that runs the pool sweep, the pool probe and the config reloader.
use crate::circuit_breaker::{BreakerState, CircuitBreakers};
use crate::client::{Connector, HyperConnector};
use crate::errors::GatewayError;
use crate::health::{Classification, HealthMonitor, HealthSnapshot};
use crate::pool::{ConnectionPool, HostHealth, HostStats};
use crate::provider::ProviderDescriptor;
use crate::registry::{ConfigFile, ConfigStream, ProviderRegistry};
use crate::routing::RoutingEngine;
use crate::supervisor::Supervisor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct Gateway {
    pub registry: Arc<ProviderRegistry>,
    pub breakers: Arc<CircuitBreakers>,
    pub health: Arc<HealthMonitor>,
    pub pool: Arc<ConnectionPool>,
    pub engine: Arc<RoutingEngine>,
    supervisor: Supervisor,
}

/// A provider as shown on the management API.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    pub classification: Classification,
    pub breaker: BreakerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Totals {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub totals: Totals,
    pub providers: Vec<HealthSnapshot>,
    pub pools: Vec<HostStats>,
}

impl Gateway {
    /// Build a gateway that opens real HTTP(S) connections.
    pub fn new(config: &ConfigFile) -> Result<Self, GatewayError> {
        Self::with_connector(config, Arc::new(HyperConnector::new()))
    }

    pub fn with_connector(
        config: &ConfigFile,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let registry = Arc::new(ProviderRegistry::new(config.providers.clone())?);
        let breakers = Arc::new(CircuitBreakers::new(config.breaker.clone()));
        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), connector));
        let engine = Arc::new(RoutingEngine::new(
            config.routing.clone(),
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&health),
            Arc::clone(&pool),
        ));
        info!(providers = registry.len(), "Gateway initialized");
        Ok(Self {
            registry,
            breakers,
            health,
            pool,
            engine,
            supervisor: Supervisor::new(),
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Start the periodic pool sweep and pool probe.
    pub fn start_background_tasks(&self) {
        let pool = Arc::clone(&self.pool);
        self.supervisor
            .spawn_periodic("pool-sweep", self.pool.config().sweep_interval(), move || {
                let pool = Arc::clone(&pool);
                async move {
                    let evicted = pool.sweep();
                    if evicted > 0 {
                        debug!(evicted, "Pool sweep evicted connections");
                    }
                }
            });

        let gateway = self.clone();
        self.supervisor
            .spawn_periodic("pool-probe", self.pool.config().probe_interval(), move || {
                let gateway = gateway.clone();
                async move {
                    let verdicts = gateway.pool.probe();
                    gateway.apply_pool_verdicts(&verdicts);
                }
            });
    }

    /// Feed per-host probe verdicts to the health of every provider on that host.
    pub fn apply_pool_verdicts(&self, verdicts: &[HostHealth]) {
        for provider in self.registry.list() {
            let Some(host) = provider.host_key() else {
                continue;
            };
            if let Some(verdict) = verdicts.iter().find(|v| v.host == host) {
                self.health.set_pool_health(&provider.name, verdict.healthy);
            }
        }
    }

    /// Swap in a new provider list. Breaker and health history survive for names that remain.
    pub fn apply_config(&self, providers: Vec<ProviderDescriptor>) -> Result<(), GatewayError> {
        let removed = self.registry.replace_all(providers)?;
        if !removed.is_empty() {
            info!(removed = ?removed, "Dropping state for removed providers");
            let registry = Arc::clone(&self.registry);
            self.breakers.retain(|name| registry.contains(name));
            self.health.retain(|name| registry.contains(name));
        }
        Ok(())
    }

    /// Apply config updates from `stream` until shutdown.
    pub async fn receive_updates<S: ConfigStream + Send + Sync + 'static>(
        &self,
        stream: S,
    ) -> Result<(), anyhow::Error> {
        let mut rx = stream.receive(&self.supervisor).await?;
        let gateway = self.clone();
        self.supervisor.spawn("config-reload", move |token| async move {
            loop {
                let update = tokio::select! {
                    _ = token.cancelled() => break,
                    update = rx.recv() => match update {
                        Some(update) => update,
                        None => break,
                    },
                };
                match update {
                    Ok(config) => match gateway.apply_config(config.providers) {
                        Ok(()) => info!(
                            providers = gateway.registry.len(),
                            "Config file changed, providers updated"
                        ),
                        Err(e) => error!("Rejected config update: {}", e),
                    },
                    Err(e) => error!("Failed to reload config: {}", e),
                }
            }
        });
        Ok(())
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.registry
            .list()
            .iter()
            .map(|provider| {
                let breaker = self.breakers.state(&provider.name);
                ProviderStatus {
                    descriptor: provider.redacted(),
                    classification: self.health.classification(&provider.name, breaker),
                    breaker,
                }
            })
            .collect()
    }

    pub fn metrics(&self) -> MetricsReport {
        let providers: Vec<HealthSnapshot> = self
            .registry
            .list()
            .iter()
            .map(|p| self.health.snapshot(&p.name, self.breakers.state(&p.name)))
            .collect();
        let total: usize = providers.iter().map(|s| s.total).sum();
        let successes: usize = providers.iter().map(|s| s.successes).sum();
        MetricsReport {
            totals: Totals {
                total,
                successes,
                failures: total - successes,
                success_rate: if total == 0 {
                    1.0
                } else {
                    successes as f64 / total as f64
                },
            },
            providers,
            pools: self.pool.stats(),
        }
    }

    /// Stop background work and wait up to `grace` for it to finish.
    pub async fn shutdown(&self, grace: Duration) {
        if !self.supervisor.shutdown(grace).await {
            warn!("Some background tasks were still running at shutdown");
        }
        info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::provider::ProviderKind;
    use crate::test_utils::{MockConnector, MockReply, openai_completion};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct MockConfigStream {
        configs: Vec<Result<ConfigFile, String>>,
    }

    #[async_trait]
    impl ConfigStream for MockConfigStream {
        async fn receive(
            &self,
            _supervisor: &Supervisor,
        ) -> Result<mpsc::Receiver<Result<ConfigFile, anyhow::Error>>, anyhow::Error> {
            let (tx, rx) = mpsc::channel(16);
            for config in self.configs.clone() {
                tx.send(config.map_err(|e| anyhow::anyhow!(e))).await?;
            }
            Ok(rx)
        }
    }

    fn provider(name: &str) -> ProviderDescriptor {
        ProviderDescriptor::builder()
            .name(name)
            .endpoint(format!("https://{name}.test/v1").parse().unwrap())
            .build()
    }

    fn config(names: &[&str]) -> ConfigFile {
        ConfigFile {
            providers: names.iter().map(|n| provider(n)).collect(),
            ..Default::default()
        }
    }

    fn gateway(names: &[&str]) -> (Gateway, MockConnector) {
        let connector = MockConnector::new();
        let gateway =
            Gateway::with_connector(&config(names), Arc::new(connector.clone())).unwrap();
        (gateway, connector)
    }

    #[tokio::test]
    async fn test_reload_keeps_state_for_surviving_providers() {
        let (gateway, _) = gateway(&["primary", "secondary"]);
        for _ in 0..5 {
            gateway.breakers.get("primary").record_failure();
            gateway.breakers.get("secondary").record_failure();
        }

        let mut renamed = config(&["primary", "tertiary"]);
        renamed.providers[0].priority = 7;
        let stream = MockConfigStream {
            configs: vec![Err("half-written file".into()), Ok(renamed)],
        };
        gateway.receive_updates(stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(gateway.registry.get("primary").unwrap().priority, 7);
        assert!(gateway.registry.contains("tertiary"));
        assert!(!gateway.registry.contains("secondary"));
        assert_eq!(gateway.breakers.state("primary"), BreakerState::Open);
        assert_eq!(gateway.breakers.state("secondary"), BreakerState::Closed);

        gateway.shutdown(Duration::from_secs(1)).await;
        assert_eq!(gateway.supervisor().active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_invalid_reload_leaves_providers_alone() {
        let (gateway, _) = gateway(&["primary"]);
        let mut broken = config(&["primary"]);
        broken.providers[0].kind = ProviderKind::Minimax;
        broken.providers[0].group_id = None;

        assert!(gateway.apply_config(broken.providers).is_err());
        assert_eq!(gateway.registry.get("primary").unwrap().kind, ProviderKind::OpenAi);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_task_feeds_pool_verdicts_into_health() {
        let connector = MockConnector::new();
        let mut config = config(&["primary", "secondary"]);
        config.pool = PoolConfig::builder()
            .probe_interval_ms(1_000)
            .min_probe_samples(2)
            .build();
        let gateway = Gateway::with_connector(&config, Arc::new(connector.clone())).unwrap();
        gateway.start_background_tasks();

        let host = gateway.registry.get("primary").unwrap().host_key().unwrap();
        for _ in 0..3 {
            let conn = gateway.pool.acquire(&host, Duration::from_secs(1)).await.unwrap();
            gateway.pool.release(conn, false);
        }
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let status = gateway.provider_status();
        assert_eq!(status[0].classification, Classification::Degraded);
        assert_eq!(status[1].classification, Classification::Healthy);
        assert!(!gateway.health.snapshot("primary", BreakerState::Closed).pool_healthy);

        gateway.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_aggregate_per_provider() {
        let (gateway, connector) = gateway(&["primary"]);
        connector.on("primary.test", |_| MockReply::ok(openai_completion("hi")));
        for _ in 0..3 {
            let mut ctx = crate::routing::RequestContext::new(
                crate::transform::canonical::CanonicalRequest {
                    model: "m".into(),
                    messages: vec![crate::transform::canonical::Message::user("hi")],
                    ..Default::default()
                },
            );
            gateway.engine.route(&mut ctx).await.unwrap();
        }

        let report = gateway.metrics();
        assert_eq!(report.totals.total, 3);
        assert_eq!(report.totals.success_rate, 1.0);
        assert_eq!(report.providers[0].successes, 3);
        assert_eq!(report.pools.len(), 1);
        assert_eq!(report.pools[0].created, 1);
        assert_eq!(report.pools[0].idle, 1);
    }

    #[test]
    fn test_provider_status_redacts_keys() {
        let mut config = config(&["primary"]);
        config.providers[0].api_key = Some("sk-live-secret".into());
        let gateway =
            Gateway::with_connector(&config, Arc::new(MockConnector::new())).unwrap();

        let listing = serde_json::to_string(&gateway.provider_status()).unwrap();
        assert!(!listing.contains("sk-live-secret"));
        assert!(listing.contains("\"breaker\":\"closed\""));
    }
}
