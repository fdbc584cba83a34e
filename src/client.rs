//! Outbound transport seam.
//!
//! A [`Connector`] opens one transport per call; the connection pool owns the result and decides
//! when to reuse or discard it. [`HttpClient`] is the per-connection request interface, so tests
//! can substitute in-memory transports for real sockets.
use crate::errors::ProviderError;
use async_trait::async_trait;
use axum::body::Body;
use hyper::Uri;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use serde::{Serialize, Serializer};
use std::fmt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::debug;
use url::Url;

/// Identity of an upstream host; connections are pooled per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    pub fn from_url(url: &Url) -> Option<Self> {
        Some(Self {
            scheme: url.scheme().to_string(),
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default()?,
        })
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Serialized in its display form, matching the `host` field of pool stats.
impl Serialize for HostKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A single established transport that can carry requests to one host.
#[async_trait]
pub trait HttpClient: fmt::Debug + Send + Sync {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;

    /// Whether the underlying transport can still carry requests.
    fn is_open(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync {
    async fn connect(&self, host: &HostKey) -> Result<Box<dyn HttpClient>, ProviderError>;
}

/// Opens HTTP/1.1 connections over TCP, with TLS for `https` hosts.
#[derive(Debug, Clone)]
pub struct HyperConnector {
    https: HttpsConnector<HttpConnector>,
}

impl Default for HyperConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperConnector {
    pub fn new() -> Self {
        Self {
            https: HttpsConnector::new(),
        }
    }
}

#[async_trait]
impl Connector for HyperConnector {
    async fn connect(&self, host: &HostKey) -> Result<Box<dyn HttpClient>, ProviderError> {
        let uri: Uri = host
            .to_string()
            .parse()
            .map_err(|e| ProviderError::Connection(format!("invalid host {host}: {e}")))?;

        let stream = self
            .https
            .clone()
            .oneshot(uri)
            .await
            .map_err(|e| ProviderError::Connection(format!("connect to {host} failed: {e}")))?;

        let (sender, connection) = http1::handshake::<_, Body>(stream)
            .await
            .map_err(|e| ProviderError::Connection(format!("handshake with {host} failed: {e}")))?;

        let name = host.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(host = %name, "Upstream connection closed: {}", e);
            }
        });
        debug!(%host, "Opened upstream connection");

        Ok(Box::new(HyperConnection {
            sender: Mutex::new(sender),
            driver,
        }))
    }
}

/// One HTTP/1.1 connection. Requests must use origin-form URIs and carry a `Host` header.
pub struct HyperConnection {
    sender: Mutex<SendRequest<Body>>,
    driver: JoinHandle<()>,
}

impl fmt::Debug for HyperConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperConnection")
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl HttpClient for HyperConnection {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        let mut sender = self.sender.lock().await;
        sender.ready().await?;
        let response = sender.send_request(req).await?;
        Ok(response.map(Body::new))
    }

    fn is_open(&self) -> bool {
        self.sender
            .try_lock()
            .map(|sender| !sender.is_closed())
            .unwrap_or(true)
    }
}

impl Drop for HyperConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_fills_default_ports() {
        let key = HostKey::from_url(&"https://api.example.com/v1".parse().unwrap()).unwrap();
        assert_eq!(key.to_string(), "https://api.example.com:443");

        let key = HostKey::from_url(&"http://localhost:8080".parse().unwrap()).unwrap();
        assert_eq!(key.port, 8080);
        assert_eq!(key.scheme, "http");
    }

    #[test]
    fn test_host_key_requires_a_host() {
        assert!(HostKey::from_url(&"data:text/plain,hi".parse().unwrap()).is_none());
    }
}
