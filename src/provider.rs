//! Provider descriptors and the adapters that talk to them.
//!
//! A [`ProviderDescriptor`] is the configuration of one upstream backend. Its [`ProviderKind`]
//! picks the wire dialect, the default endpoint and the auth scheme, and selects one of the
//! closed set of [`ProviderAdapter`]s that executes requests against it.
use crate::client::HostKey;
use crate::errors::{FormatError, GatewayError, ProviderError, TimeoutStage};
use crate::pool::{Connection, ConnectionPool};
use crate::sse::SseEventStream;
use crate::transform::Dialect;
use crate::transform::canonical::{CanonicalRequest, CanonicalResponse, ContentBlock, StopReason, Usage};
use crate::transform::extract;
use crate::transform::stream::StreamAccumulator;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use bon::Builder;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};
use url::Url;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 64 * 1024;
/// Longest retry-after hint taken at face value.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Default,
    Thinking,
    Vision,
    Tools,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Default => "default",
            Capability::Thinking => "thinking",
            Capability::Vision => "vision",
            Capability::Tools => "tools",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Anthropic,
    Cerebras,
    Zai,
    Minimax,
    /// Answers in-process without any network traffic
    Synthetic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Cerebras => "cerebras",
            ProviderKind::Zai => "zai",
            ProviderKind::Minimax => "minimax",
            ProviderKind::Synthetic => "synthetic",
        }
    }

    pub fn dialect(&self) -> Option<Dialect> {
        match self {
            ProviderKind::OpenAi | ProviderKind::Cerebras | ProviderKind::Zai => {
                Some(Dialect::OpenAi)
            }
            ProviderKind::Anthropic | ProviderKind::Minimax => Some(Dialect::Anthropic),
            ProviderKind::Synthetic => None,
        }
    }

    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com/v1"),
            ProviderKind::Cerebras => Some("https://api.cerebras.ai/v1"),
            ProviderKind::Zai => Some("https://api.z.ai/api/paas/v4"),
            ProviderKind::Minimax => Some("https://api.minimax.io/anthropic"),
            ProviderKind::Synthetic => None,
        }
    }

    /// Kinds whose models are known to emit tool calls and reasoning inline in text.
    fn extracts_by_default(&self) -> bool {
        matches!(self, ProviderKind::Cerebras | ProviderKind::Zai)
    }

    fn auth_headers(
        &self,
        provider: &ProviderDescriptor,
    ) -> Result<Vec<(&'static str, HeaderValue)>, ProviderError> {
        let value = |raw: String| {
            HeaderValue::from_str(&raw).map_err(|_| {
                ProviderError::Authentication(format!(
                    "credentials for `{}` are not a valid header value",
                    provider.name
                ))
            })
        };
        let mut headers = Vec::new();
        match self {
            ProviderKind::Anthropic => {
                if let Some(key) = &provider.api_key {
                    headers.push(("x-api-key", value(key.clone())?));
                }
                headers.push(("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION)));
            }
            ProviderKind::Minimax => {
                if let Some(key) = &provider.api_key {
                    headers.push(("authorization", value(format!("Bearer {key}"))?));
                }
                if let Some(group) = &provider.group_id {
                    headers.push(("x-groupid", value(group.clone())?));
                }
                headers.push(("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION)));
            }
            ProviderKind::OpenAi | ProviderKind::Cerebras | ProviderKind::Zai => {
                if let Some(key) = &provider.api_key {
                    headers.push(("authorization", value(format!("Bearer {key}"))?));
                }
            }
            ProviderKind::Synthetic => {}
        }
        Ok(headers)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Default]
}

fn default_priority() -> u32 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_enabled() -> bool {
    true
}

/// Configuration of one upstream provider.
///
/// Descriptors come from the config file or the management API and only change through an
/// explicit update from one of those two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct ProviderDescriptor {
    #[builder(into)]
    pub name: String,
    #[serde(default)]
    #[builder(default)]
    pub kind: ProviderKind,
    /// Base URL; defaults per kind.
    #[serde(default)]
    pub endpoint: Option<Url>,
    #[serde(default)]
    #[builder(into)]
    pub api_key: Option<String>,
    #[serde(default = "default_capabilities")]
    #[builder(default = default_capabilities())]
    pub capabilities: Vec<Capability>,
    /// Lower values are tried first.
    #[serde(default = "default_priority")]
    #[builder(default = default_priority())]
    pub priority: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_connect_timeout_ms")]
    #[builder(default = default_connect_timeout_ms())]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    #[builder(default = default_timeout_ms())]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    #[builder(default = default_max_retries())]
    pub max_retries: u32,
    #[serde(default = "default_enabled")]
    #[builder(default = default_enabled())]
    pub enabled: bool,
    /// Account header sent to MiniMax-style providers.
    #[serde(default)]
    #[builder(into)]
    pub group_id: Option<String>,
    #[serde(default)]
    #[builder(into)]
    pub default_model: Option<String>,
    /// Client model name to provider model name.
    #[serde(default)]
    #[builder(default)]
    pub model_map: HashMap<String, String>,
    /// Mine tool calls and `<think>` reasoning out of response text.
    #[serde(default)]
    #[builder(default)]
    pub extract_text_tool_calls: bool,
}

impl ProviderDescriptor {
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.clone().or_else(|| {
            self.kind
                .default_endpoint()
                .and_then(|raw| Url::parse(raw).ok())
        })
    }

    pub fn host_key(&self) -> Option<HostKey> {
        self.endpoint().as_ref().and_then(HostKey::from_url)
    }

    pub fn completion_url(&self, dialect: Dialect) -> Option<Url> {
        let base = self.endpoint()?;
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            dialect.completion_path()
        );
        Url::parse(&joined).ok()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether the provider advertises every capability in `required`. `default` is implied.
    pub fn supports(&self, required: &[Capability]) -> bool {
        required
            .iter()
            .all(|c| *c == Capability::Default || self.capabilities.contains(c))
    }

    /// The model name to send upstream for a client's requested model.
    pub fn resolve_model(&self, client_model: &str) -> String {
        self.model_map
            .get(client_model)
            .or(self.default_model.as_ref())
            .cloned()
            .unwrap_or_else(|| client_model.to_string())
    }

    pub fn extracts_text_tool_calls(&self) -> bool {
        self.extract_text_tool_calls || self.kind.extracts_by_default()
    }

    /// Model names this provider answers to, for model listings.
    pub fn advertised_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.model_map.keys().cloned().collect();
        if let Some(default) = &self.default_model {
            models.push(default.clone());
        }
        models.sort();
        models.dedup();
        models
    }

    /// A copy safe to show over the management API.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_ref().map(|_| "********".to_string()),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |reason: String| Err(GatewayError::InvalidConfig(reason));
        if self.name.trim().is_empty() || self.name.contains('/') {
            return invalid(format!("provider name `{}` is not allowed", self.name));
        }
        if self.timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return invalid(format!("`{}`: timeouts must be positive", self.name));
        }
        if self.rate_limit_per_minute == Some(0) {
            return invalid(format!("`{}`: rate_limit_per_minute must be positive", self.name));
        }
        if self.kind != ProviderKind::Synthetic {
            let Some(endpoint) = self.endpoint() else {
                return invalid(format!("`{}`: endpoint is required", self.name));
            };
            if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
                return invalid(format!(
                    "`{}`: endpoint {endpoint} must be an http(s) URL with a host",
                    self.name
                ));
            }
        }
        if self.kind == ProviderKind::Minimax {
            let length = self.group_id.as_deref().map(str::len).unwrap_or(0);
            if !(4..=64).contains(&length) {
                return invalid(format!(
                    "`{}`: minimax providers need a group_id of 4 to 64 characters",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// Executes canonical requests against one kind of provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAdapter {
    OpenAiCompatible,
    Anthropic,
    Synthetic,
}

impl ProviderAdapter {
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind.dialect() {
            Some(Dialect::OpenAi) => ProviderAdapter::OpenAiCompatible,
            Some(Dialect::Anthropic) => ProviderAdapter::Anthropic,
            None => ProviderAdapter::Synthetic,
        }
    }

    pub fn dialect(&self) -> Option<Dialect> {
        match self {
            ProviderAdapter::OpenAiCompatible => Some(Dialect::OpenAi),
            ProviderAdapter::Anthropic => Some(Dialect::Anthropic),
            ProviderAdapter::Synthetic => None,
        }
    }

    /// Borrow a pooled connection, send, and give the connection back. The connection is
    /// discarded after transport failures and timeouts.
    #[instrument(skip_all, fields(provider = %provider.name))]
    pub async fn call(
        &self,
        provider: &ProviderDescriptor,
        request: &CanonicalRequest,
        pool: &ConnectionPool,
    ) -> Result<CanonicalResponse, ProviderError> {
        if self.dialect().is_none() {
            return Ok(synthetic_response(provider, request));
        }
        let host = provider.host_key().ok_or_else(|| {
            ProviderError::Connection(format!("provider `{}` has no usable endpoint", provider.name))
        })?;
        let mut conn = pool.acquire(&host, provider.connect_timeout()).await?;
        let result = self
            .send(provider, request, &mut conn, provider.timeout())
            .await;
        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !e.poisons_connection(),
        };
        pool.release(conn, healthy);
        result
    }

    /// Encode, send over `conn`, and decode, with the whole exchange bounded by `timeout`.
    pub async fn send(
        &self,
        provider: &ProviderDescriptor,
        request: &CanonicalRequest,
        conn: &mut Connection,
        timeout: Duration,
    ) -> Result<CanonicalResponse, ProviderError> {
        let Some(dialect) = self.dialect() else {
            return Ok(synthetic_response(provider, request));
        };

        let mut outbound = request.clone();
        outbound.model = provider.resolve_model(&request.model);
        let encoded = dialect.encode_request(&outbound);
        encoded.warn_dropped(&format!("encoding for {}", provider.name));
        let http_request = build_request(provider, dialect, &encoded.value, outbound.stream)?;

        let started = Instant::now();
        let exchange = async {
            let response = conn
                .send(http_request)
                .await
                .map_err(|e| ProviderError::Connection(e.to_string()))?;
            if !response.status().is_success() {
                return Err(read_error(response, conn).await);
            }
            read_response(dialect, response).await
        };
        let mut response = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                conn.mark_unhealthy();
                return Err(ProviderError::Timeout {
                    stage: TimeoutStage::Request,
                    elapsed: started.elapsed(),
                });
            }
        };

        if provider.extracts_text_tool_calls() {
            extract::normalize_response(&mut response, !request.tools.is_empty());
        }
        if response.model.is_empty() {
            response.model = outbound.model;
        }
        debug!(
            provider = %provider.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Provider responded"
        );
        Ok(response)
    }
}

fn build_request(
    provider: &ProviderDescriptor,
    dialect: Dialect,
    body: &Value,
    stream: bool,
) -> Result<axum::extract::Request, ProviderError> {
    let url = provider.completion_url(dialect).ok_or_else(|| {
        ProviderError::Connection(format!("provider `{}` has no usable endpoint", provider.name))
    })?;
    let host = url.host_str().unwrap_or_default();
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    let mut builder = axum::http::Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::HOST, host_header)
        .header(header::CONTENT_TYPE, "application/json")
        .header(
            header::ACCEPT,
            if stream {
                "text/event-stream"
            } else {
                "application/json"
            },
        );
    for (name, value) in provider.kind.auth_headers(provider)? {
        builder = builder.header(name, value);
    }
    let payload = serde_json::to_vec(body).map_err(|e| FormatError::InvalidJson(e.to_string()))?;
    builder
        .body(Body::from(payload))
        .map_err(|e| ProviderError::Connection(format!("could not build request: {e}")))
}

/// Turn a non-success reply into an error. A body that cannot be read in full leaves the
/// connection mid-message, so it is not reused.
async fn read_error(response: axum::response::Response, conn: &mut Connection) -> ProviderError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = match axum::body::to_bytes(response.into_body(), MAX_ERROR_BODY).await {
        Ok(body) => body,
        Err(e) => {
            debug!(%status, "Unreadable error body, dropping connection: {}", e);
            conn.mark_unhealthy();
            Default::default()
        }
    };
    status_error(status, &headers, &body)
}

async fn read_response(
    dialect: Dialect,
    response: axum::response::Response,
) -> Result<CanonicalResponse, ProviderError> {
    let status = response.status();
    let is_sse = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));
    if is_sse {
        let mut accumulator = StreamAccumulator::new(dialect);
        let mut events = SseEventStream::new(response.into_body().into_data_stream());
        while let Some(event) = events.next().await {
            accumulator.push(&event?)?;
        }
        return accumulator.finish();
    }

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map_err(|e| ProviderError::Connection(format!("failed to read response: {e}")))?;
    let unparseable = |detail: String| ProviderError::ProviderServer {
        status: status.as_u16(),
        message: format!("unparseable response body: {detail}"),
    };
    let value: Value = serde_json::from_slice(&body).map_err(|e| unparseable(e.to_string()))?;
    dialect
        .decode_response(&value)
        .map_err(|e| unparseable(e.to_string()))
}

/// Map a non-success upstream status onto the error taxonomy.
pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ProviderError {
    let message = error_message(status, body);
    match status.as_u16() {
        401 | 403 => ProviderError::Authentication(message),
        429 => ProviderError::RateLimit {
            retry_after: retry_after(headers),
        },
        code if code >= 500 => ProviderError::ProviderServer {
            status: code,
            message,
        },
        code => ProviderError::Format(FormatError::Rejected {
            status: code,
            message,
        }),
    }
}

/// `retry-after-ms`, then `retry-after` in (possibly fractional) seconds, capped at
/// [`MAX_RETRY_AFTER`].
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
    };
    let secs = match read("retry-after-ms") {
        Some(ms) => ms / 1000.0,
        None => read("retry-after")?,
    };
    if secs.is_nan() {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())).ok()
}

/// Both dialects wrap errors as `{"error": {"message": ...}}`.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let message = value["error"]["message"]
            .as_str()
            .or_else(|| value["error"].as_str())
            .or_else(|| value["message"].as_str());
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("upstream error")
            .to_string()
    } else {
        text.chars().take(512).collect()
    }
}

fn synthetic_response(provider: &ProviderDescriptor, request: &CanonicalRequest) -> CanonicalResponse {
    let prompt_words: usize = request
        .messages
        .iter()
        .map(|m| m.text().split_whitespace().count())
        .sum();
    let text = format!("Synthetic response from {}.", provider.name);
    let output_tokens = text.split_whitespace().count() as u32;
    CanonicalResponse {
        id: format!("synthetic-{}", uuid::Uuid::new_v4().simple()),
        model: provider.resolve_model(&request.model),
        content: vec![ContentBlock::text(text)],
        stop_reason: Some(StopReason::EndTurn),
        usage: Usage {
            input_tokens: prompt_words as u32,
            output_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::test_utils::{MockConnector, MockReply, anthropic_message, openai_completion};
    use crate::transform::canonical::Message;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;

    fn request(model: &str) -> CanonicalRequest {
        CanonicalRequest {
            model: model.into(),
            messages: vec![Message::user("Hello there")],
            ..Default::default()
        }
    }

    fn pool(connector: &MockConnector) -> ConnectionPool {
        ConnectionPool::new(PoolConfig::default(), Arc::new(connector.clone()))
    }

    #[rstest]
    #[case(401, ProviderError::Authentication("bad key".into()))]
    #[case(403, ProviderError::Authentication("bad key".into()))]
    #[case(500, ProviderError::ProviderServer { status: 500, message: "bad key".into() })]
    #[case(529, ProviderError::ProviderServer { status: 529, message: "bad key".into() })]
    #[case(400, ProviderError::Format(FormatError::Rejected { status: 400, message: "bad key".into() }))]
    fn test_status_mapping(#[case] status: u16, #[case] expected: ProviderError) {
        let body = br#"{"error": {"type": "x", "message": "bad key"}}"#;
        let error = status_error(StatusCode::from_u16(status).unwrap(), &HeaderMap::new(), body);
        assert_eq!(error, expected);
    }

    #[rstest]
    #[case(&[("retry-after", "7")], Some(Duration::from_secs(7)))]
    #[case(&[("retry-after", "0.5")], Some(Duration::from_millis(500)))]
    #[case(&[("retry-after-ms", "250"), ("retry-after", "9")], Some(Duration::from_millis(250)))]
    #[case(&[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")], None)]
    #[case(&[], None)]
    #[case::huge(&[("retry-after", "1.5e19")], Some(MAX_RETRY_AFTER))]
    #[case::infinite(&[("retry-after-ms", "inf")], Some(MAX_RETRY_AFTER))]
    #[case::negative(&[("retry-after", "-3")], None)]
    #[case::nan(&[("retry-after", "NaN")], None)]
    fn test_rate_limit_parses_retry_after(
        #[case] headers: &[(&'static str, &'static str)],
        #[case] expected: Option<Duration>,
    ) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        let error = status_error(StatusCode::TOO_MANY_REQUESTS, &map, b"");
        assert_eq!(error, ProviderError::RateLimit { retry_after: expected });
    }

    #[test]
    fn test_error_message_falls_back_to_text_and_reason() {
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, b" upstream down "), "upstream down");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, b""), "Bad Gateway");
    }

    #[tokio::test]
    async fn test_openai_adapter_sends_bearer_and_maps_model() {
        let connector = MockConnector::new();
        connector.on("api.cerebras.ai", |_| MockReply::ok(openai_completion("Hi!")));
        let provider = ProviderDescriptor::builder()
            .name("cerebras")
            .kind(ProviderKind::Cerebras)
            .api_key("csk-123")
            .model_map(HashMap::from([("gpt-4o".to_string(), "llama-3.3-70b".to_string())]))
            .build();

        let adapter = ProviderAdapter::for_kind(provider.kind);
        let response = adapter
            .call(&provider, &request("gpt-4o"), &pool(&connector))
            .await
            .unwrap();
        assert_eq!(response.text(), "Hi!");

        let sent = &connector.requests()[0];
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.uri, "/v1/chat/completions");
        assert_eq!(sent.header("host"), Some("api.cerebras.ai"));
        assert_eq!(sent.header("authorization"), Some("Bearer csk-123"));
        assert_eq!(sent.body["model"], "llama-3.3-70b");
        assert_eq!(sent.body["messages"][0]["content"], "Hello there");
    }

    #[tokio::test]
    async fn test_anthropic_adapter_headers_and_default_max_tokens() {
        let connector = MockConnector::new();
        connector.on("api.anthropic.com", |_| MockReply::ok(anthropic_message("Bonjour")));
        let provider = ProviderDescriptor::builder()
            .name("anthropic")
            .kind(ProviderKind::Anthropic)
            .api_key("sk-ant")
            .build();

        let response = ProviderAdapter::Anthropic
            .call(&provider, &request("claude-sonnet-4"), &pool(&connector))
            .await
            .unwrap();
        assert_eq!(response.text(), "Bonjour");

        let sent = &connector.requests()[0];
        assert_eq!(sent.uri, "/v1/messages");
        assert_eq!(sent.header("x-api-key"), Some("sk-ant"));
        assert_eq!(sent.header("anthropic-version"), Some(ANTHROPIC_VERSION));
        assert_eq!(sent.header("authorization"), None);
        assert_eq!(sent.body["max_tokens"], 4096);
    }

    #[tokio::test]
    async fn test_minimax_sends_group_id() {
        let connector = MockConnector::new();
        connector.on("api.minimax.io", |_| MockReply::ok(anthropic_message("ok")));
        let provider = ProviderDescriptor::builder()
            .name("minimax")
            .kind(ProviderKind::Minimax)
            .api_key("mm-key")
            .group_id("group-1234")
            .build();
        provider.validate().unwrap();

        ProviderAdapter::for_kind(provider.kind)
            .call(&provider, &request("MiniMax-M2"), &pool(&connector))
            .await
            .unwrap();
        let sent = &connector.requests()[0];
        assert_eq!(sent.uri, "/anthropic/messages");
        assert_eq!(sent.header("authorization"), Some("Bearer mm-key"));
        assert_eq!(sent.header("x-groupid"), Some("group-1234"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_discards_connection() {
        let connector = MockConnector::new();
        connector.on("slow.test", |_| MockReply::Hang);
        let provider = ProviderDescriptor::builder()
            .name("slow")
            .endpoint("https://slow.test/v1".parse().unwrap())
            .timeout_ms(2_000)
            .build();
        let pool = pool(&connector);

        let err = ProviderAdapter::OpenAiCompatible
            .call(&provider, &request("m"), &pool)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Timeout {
                stage: TimeoutStage::Request,
                ..
            }
        ));
        let stats = pool.host_stats(&provider.host_key().unwrap()).unwrap();
        assert_eq!((stats.idle, stats.in_use), (0, 0));
    }

    #[tokio::test]
    async fn test_unreadable_error_body_discards_connection() {
        let connector = MockConnector::new();
        let oversized = "x".repeat(MAX_ERROR_BODY + 1);
        connector.on("noisy.test", move |_| {
            MockReply::text(StatusCode::INTERNAL_SERVER_ERROR, &oversized)
        });
        connector.on("terse.test", |_| {
            MockReply::text(StatusCode::INTERNAL_SERVER_ERROR, "boom")
        });
        let pool = pool(&connector);

        for (name, idle) in [("noisy", 0), ("terse", 1)] {
            let provider = ProviderDescriptor::builder()
                .name(name)
                .endpoint(format!("https://{name}.test/v1").parse().unwrap())
                .build();
            let err = ProviderAdapter::OpenAiCompatible
                .call(&provider, &request("m"), &pool)
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderError::ProviderServer { status: 500, .. }));
            let stats = pool.host_stats(&provider.host_key().unwrap()).unwrap();
            assert_eq!((stats.idle, stats.in_use), (idle, 0), "{name}");
        }
    }

    #[tokio::test]
    async fn test_unparseable_body_is_a_server_error() {
        let connector = MockConnector::new();
        connector.on("garbled.test", |_| MockReply::text(StatusCode::OK, "<html>oops</html>"));
        let provider = ProviderDescriptor::builder()
            .name("garbled")
            .endpoint("https://garbled.test/v1".parse().unwrap())
            .build();

        let err = ProviderAdapter::OpenAiCompatible
            .call(&provider, &request("m"), &pool(&connector))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ProviderServer { status: 200, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_streamed_upstream_response_is_reassembled() {
        let connector = MockConnector::new();
        connector.on("stream.test", |_| {
            MockReply::Sse(vec![
                "data: {\"id\":\"c1\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n".into(),
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n".into(),
            ])
        });
        let provider = ProviderDescriptor::builder()
            .name("stream")
            .endpoint("https://stream.test/v1".parse().unwrap())
            .build();
        let mut streaming = request("m");
        streaming.stream = true;

        let response = ProviderAdapter::OpenAiCompatible
            .call(&provider, &streaming, &pool(&connector))
            .await
            .unwrap();
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(connector.requests()[0].header("accept"), Some("text/event-stream"));
    }

    #[tokio::test]
    async fn test_extraction_lifts_inline_tool_calls() {
        let connector = MockConnector::new();
        connector.on("api.z.ai", |_| {
            MockReply::ok(openai_completion(
                "<think>need weather</think><tool_call>{\"name\": \"weather\", \"arguments\": {\"city\": \"Oslo\"}}</tool_call>",
            ))
        });
        let provider = ProviderDescriptor::builder()
            .name("zai")
            .kind(ProviderKind::Zai)
            .api_key("k")
            .build();
        let mut with_tools = request("glm-4.6");
        with_tools.tools = vec![crate::transform::canonical::ToolDefinition {
            name: "weather".into(),
            description: None,
            parameters: json!({"type": "object"}),
        }];

        let response = ProviderAdapter::for_kind(provider.kind)
            .call(&provider, &with_tools, &pool(&connector))
            .await
            .unwrap();
        assert_eq!(response.thinking().as_deref(), Some("need weather"));
        let calls: Vec<_> = response.tool_calls().collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "weather");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[tokio::test]
    async fn test_synthetic_provider_answers_without_network() {
        let connector = MockConnector::new();
        let provider = ProviderDescriptor::builder()
            .name("synthetic")
            .kind(ProviderKind::Synthetic)
            .build();
        provider.validate().unwrap();

        let response = ProviderAdapter::for_kind(provider.kind)
            .call(&provider, &request("any"), &pool(&connector))
            .await
            .unwrap();
        assert_eq!(response.text(), "Synthetic response from synthetic.");
        assert_eq!(response.usage.input_tokens, 2);
        assert_eq!(connector.connects(), 0);
    }

    #[rstest]
    #[case::minimax_without_group(ProviderDescriptor::builder().name("m").kind(ProviderKind::Minimax).build())]
    #[case::short_group(ProviderDescriptor::builder().name("m").kind(ProviderKind::Minimax).group_id("abc").build())]
    #[case::zero_timeout(ProviderDescriptor::builder().name("o").timeout_ms(0).build())]
    #[case::bad_scheme(ProviderDescriptor::builder().name("o").endpoint("ftp://x.test".parse().unwrap()).build())]
    #[case::slash_in_name(ProviderDescriptor::builder().name("a/b").build())]
    #[case::zero_rate_limit(ProviderDescriptor::builder().name("o").rate_limit_per_minute(0).build())]
    fn test_invalid_descriptors_are_rejected(#[case] descriptor: ProviderDescriptor) {
        assert!(matches!(
            descriptor.validate(),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_model_resolution_order() {
        let provider = ProviderDescriptor::builder()
            .name("p")
            .default_model("house-model")
            .model_map(HashMap::from([("gpt-4o".to_string(), "mapped".to_string())]))
            .build();
        assert_eq!(provider.resolve_model("gpt-4o"), "mapped");
        assert_eq!(provider.resolve_model("other"), "house-model");

        let plain = ProviderDescriptor::builder().name("p").build();
        assert_eq!(plain.resolve_model("other"), "other");
    }

    #[test]
    fn test_descriptor_defaults_from_json() {
        let provider: ProviderDescriptor =
            serde_json::from_value(json!({"name": "openai", "api_key": "sk"})).unwrap();
        assert_eq!(provider.kind, ProviderKind::OpenAi);
        assert_eq!(provider.capabilities, vec![Capability::Default]);
        assert!(provider.enabled);
        assert_eq!(provider.priority, 100);
        assert_eq!(
            provider.completion_url(Dialect::OpenAi).unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(provider.redacted().api_key.as_deref(), Some("********"));
    }
}
