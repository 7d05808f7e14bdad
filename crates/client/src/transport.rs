//! HTTP transport towards a single registry (or metadata) host.

use async_trait::async_trait;
use registrar_common::RegistryEndpoint;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

pub const MAX_CONNECTIONS_PER_ROUTE: usize = 10;
pub const MAX_CONNECTIONS_TOTAL: usize = 20;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{method} {url} failed: {source}")]
    Request {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} returned {actual}, expected {expected}")]
    StatusMismatch {
        method: Method,
        url: String,
        expected: StatusCode,
        actual: StatusCode,
    },
    #[error("failed to read response of {method} {url}: {source}")]
    ResponseRead {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

/// Request capability used by the registration client. Each call fails unless
/// the response status equals `expected`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn host(&self) -> &str;

    async fn get(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError>;

    async fn post(&self, uri: &str, body: String, expected: StatusCode) -> Result<String, TransportError>;

    async fn put(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError>;

    async fn delete(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn host(&self) -> &str {
        (**self).host()
    }

    async fn get(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
        (**self).get(uri, expected).await
    }

    async fn post(&self, uri: &str, body: String, expected: StatusCode) -> Result<String, TransportError> {
        (**self).post(uri, body, expected).await
    }

    async fn put(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
        (**self).put(uri, expected).await
    }

    async fn delete(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
        (**self).delete(uri, expected).await
    }
}

/// Pooled HTTP client bound to one `host:port`.
#[derive(Clone)]
pub struct RestClient {
    host: String,
    base_url: String,
    client: Client,
    permits: Arc<Semaphore>,
}

impl RestClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(MAX_CONNECTIONS_PER_ROUTE)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(TransportError::Build)?;

        let host = host.trim().to_string();
        Ok(Self {
            base_url: format!("http://{}:{}", host, port),
            host,
            client,
            permits: Arc::new(Semaphore::new(MAX_CONNECTIONS_TOTAL)),
        })
    }

    pub fn for_endpoint(endpoint: &RegistryEndpoint, timeout: Duration) -> Result<Self, TransportError> {
        Self::new(&endpoint.host, endpoint.port, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<String>,
        expected: StatusCode,
    ) -> Result<String, TransportError> {
        let url = format!("{}{}", self.base_url, uri);
        debug!(%method, %url, "sending request");

        // The semaphore is never closed, so acquiring only waits for a free slot.
        let _permit = self.permits.acquire().await.ok();

        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => {
                error!(%method, %url, error = %source, "request failed");
                return Err(TransportError::Request { method, url, source });
            }
        };

        let actual = response.status();
        if actual != expected {
            warn!(%method, %url, %actual, %expected, "unexpected response status");
            return Err(TransportError::StatusMismatch {
                method,
                url,
                expected,
                actual,
            });
        }

        if actual != StatusCode::OK {
            return Ok(String::new());
        }

        match response.text().await {
            Ok(text) => Ok(text),
            Err(source) => {
                error!(%method, %url, error = %source, "failed to read response body");
                Err(TransportError::ResponseRead { method, url, source })
            }
        }
    }
}

#[async_trait]
impl Transport for RestClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn get(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
        self.send(Method::GET, uri, None, expected).await
    }

    async fn post(&self, uri: &str, body: String, expected: StatusCode) -> Result<String, TransportError> {
        self.send(Method::POST, uri, Some(body), expected).await
    }

    async fn put(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
        self.send(Method::PUT, uri, None, expected).await
    }

    async fn delete(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
        self.send(Method::DELETE, uri, None, expected).await
    }
}
