//! HTTP transport seam for external-backed service methods.
//!
//! The external call pipeline talks to an [`HttpTransport`]; the production
//! implementation is [`ReqwestTransport`]. Both sends observe a
//! [`CancellationToken`] so a lost timeout race actually aborts the request.

use crate::cancellation::CancellationToken;
use crate::errors::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Receives response body chunks for streaming calls.
pub type ChunkHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method, upper case.
    pub method: String,
    /// Target URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
    /// Transport-level timeout.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Creates a request with no headers or body.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Body parsed as JSON, a JSON string if it was not JSON, or null if empty
    /// or streamed.
    pub body: serde_json::Value,
}

impl HttpResponse {
    /// Creates a response with the given status and body.
    #[must_use]
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Decodes a response body: JSON when possible, otherwise a string.
#[must_use]
pub fn decode_body(raw: &[u8]) -> serde_json::Value {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(raw).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(raw).into_owned())
    })
}

/// Sends HTTP requests on behalf of the registry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and buffers the full response.
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError>;

    /// Sends a request and hands body chunks to `on_chunk` as they arrive.
    ///
    /// The returned response carries a null body when the status is 2xx.
    /// The default implementation buffers and delivers the body as one chunk.
    async fn send_streaming(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
        on_chunk: ChunkHandler,
    ) -> Result<HttpResponse, TransportError> {
        let mut response = self.send(request, cancel).await?;
        if response.is_success() {
            let body = std::mem::take(&mut response.body);
            if !body.is_null() {
                on_chunk(Bytes::from(body.to_string()));
            }
        }
        Ok(response)
    }
}

/// A transport that rejects every request; used when no HTTP client is compiled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransport;

#[async_trait]
impl HttpTransport for NoTransport {
    async fn send(
        &self,
        request: HttpRequest,
        _cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        Err(TransportError::InvalidRequest(format!(
            "no HTTP transport configured for {}",
            request.url
        )))
    }
}

/// Production transport backed by `reqwest`.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl ReqwestTransport {
    /// Creates a transport with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport around an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: &HttpRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    fn map_error(err: &reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else if err.is_decode() || err.is_body() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }

    fn headers_of(response: &reqwest::Response) -> HashMap<String, String> {
        response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect()
    }

    async fn exchange(
        &self,
        request: HttpRequest,
        on_chunk: Option<ChunkHandler>,
    ) -> Result<HttpResponse, TransportError> {
        let timeout = request.timeout;
        let mut response = self
            .build(&request)?
            .send()
            .await
            .map_err(|e| Self::map_error(&e, timeout))?;

        let status = response.status().as_u16();
        let headers = Self::headers_of(&response);

        match on_chunk {
            Some(handler) if response.status().is_success() => {
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|e| Self::map_error(&e, timeout))?
                {
                    handler(chunk);
                }
                Ok(HttpResponse {
                    status,
                    headers,
                    body: serde_json::Value::Null,
                })
            }
            _ => {
                let raw = response
                    .bytes()
                    .await
                    .map_err(|e| Self::map_error(&e, timeout))?;
                Ok(HttpResponse {
                    status,
                    headers,
                    body: decode_body(&raw),
                })
            }
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        tokio::select! {
            result = self.exchange(request, None) => result,
            () = cancel.cancelled() => Err(TransportError::Cancelled(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            )),
        }
    }

    async fn send_streaming(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
        on_chunk: ChunkHandler,
    ) -> Result<HttpResponse, TransportError> {
        tokio::select! {
            result = self.exchange(request, Some(on_chunk)) => result,
            () = cancel.cancelled() => Err(TransportError::Cancelled(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            )),
        }
    }
}
