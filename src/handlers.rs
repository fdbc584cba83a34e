/// Axum handlers for the completion surface
use crate::AppState;
use crate::errors::GatewayError;
use crate::models::ListModelResponse;
use crate::routing::RequestContext;
use crate::transform::stream::encode_stream;
use crate::transform::{Dialect, decode_inbound};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use tracing::{debug, info, instrument};

pub const PROVIDER_HEADER: &str = "x-switchyard-provider";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[instrument(skip_all)]
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    complete(&state, "/v1/chat/completions", &headers, &body).await
}

#[instrument(skip_all)]
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    complete(&state, "/v1/messages", &headers, &body).await
}

/// Decode in whatever dialect the client speaks, route, and answer in that same dialect.
async fn complete(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, GatewayError> {
    debug!("Received request body of size: {}", body.len());
    let (dialect, decoded) = decode_inbound(Some(path), headers, body)?;
    decoded.warn_dropped("decoding the client request");

    let mut ctx = RequestContext::new(decoded.value);
    info!(
        %dialect,
        model = %ctx.request.model,
        correlation_id = %ctx.correlation_id,
        "Routing request"
    );
    let response = state.gateway.engine.route(&mut ctx).await?;

    let mut reply = if ctx.request.stream {
        stream_response(dialect, &response)
    } else {
        Json(dialect.encode_response(&response)).into_response()
    };
    let reply_headers = reply.headers_mut();
    if let Ok(id) = HeaderValue::from_str(&ctx.correlation_id.to_string()) {
        reply_headers.insert(REQUEST_ID_HEADER, id);
    }
    if let Some(provider) = ctx
        .last_provider()
        .and_then(|p| HeaderValue::from_str(p).ok())
    {
        reply_headers.insert(PROVIDER_HEADER, provider);
    }
    Ok(reply)
}

/// Replay a complete response as the client dialect's SSE event sequence.
fn stream_response(
    dialect: Dialect,
    response: &crate::transform::canonical::CanonicalResponse,
) -> Response {
    let events = encode_stream(dialect, response);
    let body = Body::from_stream(futures_util::stream::iter(
        events.into_iter().map(Ok::<_, Infallible>),
    ));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

#[instrument(skip(state))]
pub async fn models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListModelResponse::from_providers(
        &state.gateway.registry.list(),
    ))
}
