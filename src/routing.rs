//! Provider selection, retry and failover.
//!
//! For each request the engine ranks the eligible providers once, then walks that list. Each
//! provider is gated by its per-minute limiter and its circuit breaker, retried with exponential
//! backoff on transient failures, and abandoned for the next one when retries run out. Every
//! outcome is recorded into the breakers and the health monitor.
use crate::circuit_breaker::CircuitBreakers;
use crate::errors::{Attempt, GatewayError, ProviderError};
use crate::health::HealthMonitor;
use crate::pool::ConnectionPool;
use crate::provider::{Capability, ProviderAdapter, ProviderDescriptor};
use crate::registry::ProviderRegistry;
use crate::transform::canonical::{CanonicalRequest, CanonicalResponse, Message};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct RoutingConfig {
    /// Delay before the first retry on the same provider; doubles with each retry.
    #[builder(default = 250)]
    pub base_delay_ms: u64,
    #[builder(default = 5_000)]
    pub max_delay_ms: u64,
    /// Failed attempts allowed per request, across all providers.
    #[builder(default = 5)]
    pub max_failures: u32,
    /// Longest retry-after hint worth waiting for instead of failing over.
    #[builder(default = 10_000)]
    pub max_retry_after_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RoutingConfig {
    /// `min(base * 2^retry, max)`
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.max_failures == 0 {
            return Err(GatewayError::InvalidConfig(
                "routing.max_failures must be positive".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(GatewayError::InvalidConfig(
                "routing.base_delay_ms must not exceed routing.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Capabilities beyond `default` that a request needs from its provider.
pub fn required_capabilities(request: &CanonicalRequest) -> Vec<Capability> {
    let mut required = Vec::new();
    if request.has_images() {
        required.push(Capability::Vision);
    }
    if request.uses_tools() {
        required.push(Capability::Tools);
    }
    if request.wants_thinking() {
        required.push(Capability::Thinking);
    }
    required
}

/// Per-call routing state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request: CanonicalRequest,
    pub required: Vec<Capability>,
    pub correlation_id: Uuid,
    /// Network attempts made so far.
    pub attempts: u32,
    /// Providers contacted, in order.
    pub tried: Vec<String>,
}

impl RequestContext {
    pub fn new(request: CanonicalRequest) -> Self {
        Self {
            required: required_capabilities(&request),
            request,
            correlation_id: Uuid::new_v4(),
            attempts: 0,
            tried: Vec::new(),
        }
    }

    /// The provider that produced the final outcome, if any was contacted.
    pub fn last_provider(&self) -> Option<&str> {
        self.tried.last().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub candidates: Vec<Arc<ProviderDescriptor>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub provider: String,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RoutingEngine {
    config: RoutingConfig,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakers>,
    health: Arc<HealthMonitor>,
    pool: Arc<ConnectionPool>,
}

impl RoutingEngine {
    pub fn new(
        config: RoutingConfig,
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakers>,
        health: Arc<HealthMonitor>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            config,
            registry,
            breakers,
            health,
            pool,
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Eligible providers ordered by priority, then health. The sort is stable, so
    /// configuration order breaks ties.
    pub fn decide(&self, ctx: &RequestContext) -> Result<RouteDecision, GatewayError> {
        let mut ranked: Vec<((u32, u8), Arc<ProviderDescriptor>)> = self
            .registry
            .list()
            .into_iter()
            .filter(|p| p.enabled && p.supports(&ctx.required))
            .map(|p| {
                let breaker = self.breakers.state(&p.name);
                let rank = self.health.classification(&p.name, breaker).rank();
                ((p.priority, rank), p)
            })
            .collect();
        if ranked.is_empty() {
            return Err(GatewayError::NoEligibleProvider {
                required: ctx.required.clone(),
            });
        }
        ranked.sort_by_key(|(key, _)| *key);
        Ok(RouteDecision {
            candidates: ranked.into_iter().map(|(_, p)| p).collect(),
        })
    }

    #[instrument(skip_all, fields(correlation_id = %ctx.correlation_id, model = %ctx.request.model))]
    pub async fn route(&self, ctx: &mut RequestContext) -> Result<CanonicalResponse, GatewayError> {
        let decision = self.decide(ctx)?;
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut failures = 0u32;

        'candidates: for provider in &decision.candidates {
            let name = provider.name.as_str();
            let breaker = self.breakers.get(name);
            let adapter = ProviderAdapter::for_kind(provider.kind);
            let mut retry = 0u32;

            loop {
                if !self.registry.try_acquire(name) {
                    if retry == 0 {
                        debug!(provider = name, "Per-minute limit reached, skipping");
                        attempts.push(Attempt::new(
                            name,
                            &ProviderError::RateLimit { retry_after: None },
                        ));
                        skipped(name, "rate_limit");
                    }
                    break;
                }
                let Some(permit) = breaker.try_acquire() else {
                    if retry == 0 {
                        debug!(provider = name, "Circuit open, skipping");
                        attempts.push(Attempt::new(name, &ProviderError::CircuitOpen));
                        skipped(name, "circuit_open");
                    }
                    break;
                };

                ctx.attempts += 1;
                if retry == 0 {
                    ctx.tried.push(name.to_string());
                }
                let started = Instant::now();
                let result = adapter.call(provider, &ctx.request, &self.pool).await;
                let elapsed = started.elapsed();
                metrics::histogram!("provider_request_duration_seconds", "provider" => name.to_string())
                    .record(elapsed.as_secs_f64());

                let error = match result {
                    Ok(response) => {
                        permit.record_success();
                        self.health.record_success(name, elapsed);
                        outcome(name, "success");
                        if !attempts.is_empty() {
                            info!(
                                provider = name,
                                failed_attempts = attempts.len(),
                                "Request served after failover"
                            );
                        }
                        return Ok(response);
                    }
                    Err(error) => error,
                };

                permit.record_failure();
                self.health.record_failure(name, elapsed);
                outcome(name, error.kind().as_str());
                failures += 1;
                warn!(provider = name, kind = error.kind().as_str(), retry, "Attempt failed: {}", error);
                attempts.push(Attempt::new(name, &error));

                if matches!(
                    error,
                    ProviderError::Authentication(_) | ProviderError::Format(_)
                ) {
                    return Err(GatewayError::Provider {
                        provider: name.to_string(),
                        source: error,
                    });
                }
                if failures >= self.config.max_failures {
                    warn!(failures, "Failure budget for this request is spent");
                    break 'candidates;
                }

                let delay = match &error {
                    ProviderError::RateLimit { retry_after } => {
                        self.health.record_rate_limit(name, *retry_after);
                        match retry_after {
                            Some(hint)
                                if *hint <= self.config.max_retry_after()
                                    && retry < provider.max_retries =>
                            {
                                *hint
                            }
                            _ => break,
                        }
                    }
                    e if e.is_retryable() && retry < provider.max_retries => {
                        self.config.backoff(retry)
                    }
                    _ => break,
                };
                retry += 1;
                debug!(provider = name, retry, delay_ms = delay.as_millis() as u64, "Retrying");
                tokio::time::sleep(delay).await;
            }

            metrics::counter!("provider_failovers_total", "from" => name.to_string()).increment(1);
        }

        Err(GatewayError::Exhausted { attempts })
    }

    /// Send one minimal request to `name`, ignoring selection and the breaker gate.
    #[instrument(skip(self))]
    pub async fn probe(&self, name: &str) -> Result<ProbeReport, GatewayError> {
        let provider = self
            .registry
            .get(name)
            .ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))?;
        let request = CanonicalRequest {
            model: probe_model(&provider),
            messages: vec![Message::user("ping")],
            max_tokens: Some(1),
            ..Default::default()
        };

        let started = Instant::now();
        let result = ProviderAdapter::for_kind(provider.kind)
            .call(&provider, &request, &self.pool)
            .await;
        let elapsed = started.elapsed();
        let breaker = self.breakers.get(name);
        let error = match result {
            Ok(_) => {
                breaker.record_success();
                self.health.record_success(name, elapsed);
                None
            }
            Err(error) => {
                breaker.record_failure();
                self.health.record_failure(name, elapsed);
                if let ProviderError::RateLimit { retry_after } = &error {
                    self.health.record_rate_limit(name, *retry_after);
                }
                Some(error.to_string())
            }
        };
        info!(provider = name, success = error.is_none(), "Probe finished");
        Ok(ProbeReport {
            provider: name.to_string(),
            success: error.is_none(),
            latency_ms: elapsed.as_millis() as u64,
            error,
        })
    }
}

fn probe_model(provider: &ProviderDescriptor) -> String {
    provider
        .default_model
        .clone()
        .or_else(|| {
            let mut mapped: Vec<&String> = provider.model_map.values().collect();
            mapped.sort();
            mapped.first().map(|m| m.to_string())
        })
        .unwrap_or_else(|| "default".to_string())
}

fn outcome(provider: &str, outcome: &'static str) {
    metrics::counter!(
        "provider_attempts_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

fn skipped(provider: &str, reason: &'static str) {
    metrics::counter!(
        "provider_skips_total",
        "provider" => provider.to_string(),
        "reason" => reason
    )
    .increment(1);
}
