/// Axum handlers for the management surface
use crate::AppState;
use crate::errors::GatewayError;
use crate::gateway::{MetricsReport, ProviderStatus};
use crate::provider::ProviderDescriptor;
use crate::routing::ProbeReport;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::Value;
use tracing::instrument;

#[instrument(skip(state))]
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderStatus>> {
    Json(state.gateway.provider_status())
}

#[instrument(skip_all)]
pub async fn add_provider(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<ProviderDescriptor>), GatewayError> {
    let descriptor: ProviderDescriptor =
        serde_json::from_value(body).map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
    let added = state.gateway.registry.insert(descriptor)?;
    Ok((StatusCode::CREATED, Json(added.redacted())))
}

#[instrument(skip(state, patch))]
pub async fn update_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Json<ProviderDescriptor>, GatewayError> {
    let updated = state.gateway.registry.update(&name, &patch)?;
    Ok(Json(updated.redacted()))
}

#[instrument(skip(state))]
pub async fn test_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProbeReport>, GatewayError> {
    Ok(Json(state.gateway.engine.probe(&name).await?))
}

#[instrument(skip(state))]
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(state.gateway.metrics())
}
