//! Error taxonomy shared by the connection pool, provider adapters and the routing engine.
//!
//! [`ProviderError`] describes why a single attempt against one provider failed; the routing
//! engine branches on its [`ErrorKind`]. [`GatewayError`] is what finally reaches a caller.
use crate::provider::Capability;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Which deadline a [`ProviderError::Timeout`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    /// Waiting for a free slot in a host's connection pool
    Acquire,
    /// Establishing a new transport connection
    Connect,
    /// Sending the request and reading the full response
    Request,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::Acquire => write!(f, "connection acquire"),
            TimeoutStage::Connect => write!(f, "connect"),
            TimeoutStage::Request => write!(f, "request"),
        }
    }
}

/// A payload that does not fit the canonical model or a provider's wire schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload matches no known provider schema: {0}")]
    Unrecognized(String),
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("provider rejected the payload ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl FormatError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FormatError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Why a single attempt against a provider failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out after {}ms during {stage}", .elapsed.as_millis())]
    Timeout {
        stage: TimeoutStage,
        elapsed: Duration,
    },
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },
    #[error("provider server error ({status}): {message}")]
    ProviderServer { status: u16, message: String },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("circuit breaker is open")]
    CircuitOpen,
}

/// Flat discriminant of [`ProviderError`], used for metrics labels and attempt summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    Authentication,
    RateLimit,
    ProviderServer,
    Format,
    CircuitOpen,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ProviderServer => "provider_server",
            ErrorKind::Format => "format",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Connection(_) => ErrorKind::Connection,
            ProviderError::Timeout { .. } => ErrorKind::Timeout,
            ProviderError::Authentication(_) => ErrorKind::Authentication,
            ProviderError::RateLimit { .. } => ErrorKind::RateLimit,
            ProviderError::ProviderServer { .. } => ErrorKind::ProviderServer,
            ProviderError::Format(_) => ErrorKind::Format,
            ProviderError::CircuitOpen => ErrorKind::CircuitOpen,
        }
    }

    /// Retryable errors stay inside the failover loop; the rest surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Connection(_)
                | ProviderError::Timeout { .. }
                | ProviderError::ProviderServer { .. }
                | ProviderError::RateLimit { .. }
        )
    }

    /// Whether the transport that carried this attempt must be discarded.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            ProviderError::Connection(_) | ProviderError::Timeout { .. }
        )
    }
}

/// One provider's entry in the terminal failure summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub provider: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl Attempt {
    pub fn new(provider: &str, error: &ProviderError) -> Self {
        Self {
            provider: provider.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

fn display_capabilities(required: &[Capability]) -> String {
    if required.is_empty() {
        return "the request".to_string();
    }
    required
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The inbound payload was rejected before any provider was contacted.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// A non-retryable provider failure, surfaced without failover.
    #[error("provider `{provider}` failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: ProviderError,
    },
    #[error("no enabled provider supports {}", display_capabilities(.required))]
    NoEligibleProvider { required: Vec<Capability> },
    #[error("all providers failed: {}", display_attempts(.attempts))]
    Exhausted { attempts: Vec<Attempt> },
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("provider `{0}` already exists")]
    ProviderExists(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayError {
    /// Attempts made before the error was returned; empty when nothing was tried.
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            GatewayError::Exhausted { attempts } => attempts,
            _ => &[],
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            GatewayError::Format(_) => "format_error",
            GatewayError::Provider { source, .. } => match source.kind() {
                ErrorKind::Authentication => "authentication_error",
                ErrorKind::Format => "format_error",
                _ => "provider_error",
            },
            GatewayError::NoEligibleProvider { .. } => "no_eligible_provider",
            GatewayError::Exhausted { .. } => "providers_exhausted",
            GatewayError::UnknownProvider(_) => "not_found",
            GatewayError::ProviderExists(_) => "conflict",
            GatewayError::InvalidConfig(_) => "invalid_config",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Format(_) => StatusCode::BAD_REQUEST,
            GatewayError::Provider { source, .. } => match source {
                ProviderError::Format(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            },
            GatewayError::NoEligibleProvider { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Exhausted { attempts } => {
                if !attempts.is_empty() && attempts.iter().all(|a| a.kind == ErrorKind::RateLimit)
                {
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }
            GatewayError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            GatewayError::ProviderExists(_) => StatusCode::CONFLICT,
            GatewayError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "type": self.type_name(),
            "message": self.to_string(),
        });
        if !self.attempts().is_empty() {
            error["attempts"] = json!(self.attempts());
        }
        (self.status_code(), Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProviderError::Connection("reset".into()), true, true)]
    #[case(ProviderError::Timeout { stage: TimeoutStage::Request, elapsed: Duration::from_secs(1) }, true, true)]
    #[case(ProviderError::ProviderServer { status: 503, message: "down".into() }, true, false)]
    #[case(ProviderError::RateLimit { retry_after: None }, true, false)]
    #[case(ProviderError::Authentication("bad key".into()), false, false)]
    #[case(ProviderError::Format(FormatError::MissingField("messages".into())), false, false)]
    fn test_retry_and_poison_classification(
        #[case] error: ProviderError,
        #[case] retryable: bool,
        #[case] poisons: bool,
    ) {
        assert_eq!(error.is_retryable(), retryable);
        assert_eq!(error.poisons_connection(), poisons);
    }

    #[test]
    fn test_exhausted_by_rate_limits_maps_to_429() {
        let error = GatewayError::Exhausted {
            attempts: vec![Attempt::new(
                "primary",
                &ProviderError::RateLimit { retry_after: None },
            )],
        };
        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let mixed = GatewayError::Exhausted {
            attempts: vec![
                Attempt::new("primary", &ProviderError::RateLimit { retry_after: None }),
                Attempt::new("secondary", &ProviderError::Connection("refused".into())),
            ],
        };
        assert_eq!(mixed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(mixed.to_string().contains("secondary: connection error: refused"));
    }

    #[test]
    fn test_no_eligible_provider_message_names_capabilities() {
        let error = GatewayError::NoEligibleProvider {
            required: vec![Capability::Vision],
        };
        assert_eq!(error.to_string(), "no enabled provider supports vision");
        assert_eq!(error.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(error.attempts().is_empty());
    }
}
