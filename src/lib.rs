//! Switchyard - a resilient multi-provider LLM gateway
//!
//! This library accepts OpenAI- or Anthropic-style completion requests and dispatches them to a
//! prioritized set of upstream providers. It pools upstream connections, isolates failing
//! providers with circuit breakers, tracks provider health, fails over between providers, and
//! translates payloads between dialects.

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod admin;
pub mod auth;
pub mod circuit_breaker;
pub mod client;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod models;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod routing;
pub mod sse;
pub mod supervisor;
pub mod transform;

use gateway::Gateway;
use registry::Auth;

/// The main application state: the gateway and the keys that guard it
#[derive(Clone, Debug)]
pub struct AppState {
    pub gateway: Gateway,
    pub auth: Arc<Auth>,
}

impl AppState {
    pub fn new(gateway: Gateway, auth: Auth) -> Self {
        Self {
            gateway,
            auth: Arc::new(auth),
        }
    }
}

/// Build the main router for the gateway
/// This creates routes for:
/// - `/v1/chat/completions` and `/v1/messages` - Routed completions in either dialect
/// - `/v1/models` - Returns available models
/// - `/admin/*` - Provider management and metrics
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    let completions = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/models", get(handlers::models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_client_key,
        ));
    let admin = Router::new()
        .route(
            "/admin/providers",
            get(admin::list_providers).post(admin::add_provider),
        )
        .route("/admin/providers/{name}", put(admin::update_provider))
        .route("/admin/providers/{name}/test", post(admin::test_provider))
        .route("/admin/metrics", get(admin::metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin_key,
        ));
    completions.merge(admin).with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// Building the pair installs the global recorder, so counters emitted by the routing engine,
/// the circuit breakers and the pool show up on the same endpoint as the request metrics.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
