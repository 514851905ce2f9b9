//! Configuration for service methods backed by a remote HTTP endpoint.
//!
//! The data fields deserialize from the camelCase wire shape. Code hooks
//! (transforms, validator, middleware, stream handler, token provider) are
//! attached with builder methods and are not serialized.

use super::middleware::{Middleware, MiddlewareChain};
use super::transport::ChunkHandler;
use crate::errors::CallError;
use crate::resilience::{AuthConfig, BackoffPolicy, CircuitBreakerConfig, RateLimitConfig, TokenProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Rewrites a request or response payload.
pub type PayloadTransform = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Decides whether a transformed response is acceptable.
pub type ResponseValidator = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Rewrites the terminal error of a failed call.
pub type ErrorTransform = Arc<dyn Fn(CallError) -> CallError + Send + Sync>;

fn default_method() -> String {
    "GET".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_retry_on_status() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

/// HTTP-level retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration.
    #[must_use]
    pub fn new(max_retries: u32, backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            max_backoff_ms,
        }
    }

    /// Delay before the given 1-based retry: `backoffMs * 2^(n-1)`, capped.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        BackoffPolicy::exponential(self.backoff_ms, self.max_backoff_ms).delay_for_attempt(retry)
    }
}

/// Handling of non-success responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlingConfig {
    /// Statuses that are retried while retries remain.
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<u16>,
    /// Payload returned instead of failing once retries are exhausted.
    #[serde(default)]
    pub fallback_value: Option<serde_json::Value>,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            retry_on_status: default_retry_on_status(),
            fallback_value: None,
        }
    }
}

/// Streaming settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    /// Deliver the response body in chunks to the stream handler.
    #[serde(default)]
    pub enabled: bool,
}

/// Code hooks attached to an external method.
#[derive(Clone, Default)]
pub struct ExternalHooks {
    /// Applied to the request payload after `pre` middleware.
    pub request_transform: Option<PayloadTransform>,
    /// Applied to a successful response payload.
    pub response_transform: Option<PayloadTransform>,
    /// Rejects a transformed response when it returns false.
    pub validator: Option<ResponseValidator>,
    /// Applied to the terminal error.
    pub error_transform: Option<ErrorTransform>,
    /// Request/response middleware.
    pub middlewares: MiddlewareChain,
    /// Receives body chunks when streaming is enabled.
    pub stream_handler: Option<ChunkHandler>,
    /// Token source for bearer and OAuth2 auth.
    pub token_provider: Option<Arc<dyn TokenProvider>>,
}

impl fmt::Debug for ExternalHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalHooks")
            .field("request_transform", &self.request_transform.is_some())
            .field("response_transform", &self.response_transform.is_some())
            .field("validator", &self.validator.is_some())
            .field("error_transform", &self.error_transform.is_some())
            .field("middlewares", &self.middlewares)
            .field("stream_handler", &self.stream_handler.is_some())
            .field("token_provider", &self.token_provider.is_some())
            .finish()
    }
}

/// A service method backed by a remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalApiConfig {
    /// Endpoint URL; also the key for rate limiting, breaking and auth.
    pub url: String,
    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Static headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    /// Retry settings.
    #[serde(default)]
    pub retry_config: RetryConfig,
    /// Non-success handling.
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    /// Rate limit; none means unthrottled.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Circuit breaker; none means no breaker.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Authentication; none means no auth headers.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Streaming settings.
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Code hooks.
    #[serde(skip)]
    pub hooks: ExternalHooks,
}

impl ExternalApiConfig {
    /// Creates a GET configuration for a URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: HashMap::new(),
            timeout_ms: None,
            retry_config: RetryConfig::default(),
            error_handling: ErrorHandlingConfig::default(),
            rate_limit: None,
            circuit_breaker: None,
            auth: None,
            streaming: StreamingConfig::default(),
            hooks: ExternalHooks::default(),
        }
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_uppercase();
        self
    }

    /// Adds a static header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }

    /// Sets the retryable statuses.
    #[must_use]
    pub fn with_retry_on_status(mut self, statuses: Vec<u16>) -> Self {
        self.error_handling.retry_on_status = statuses;
        self
    }

    /// Sets the fallback value.
    #[must_use]
    pub fn with_fallback_value(mut self, value: serde_json::Value) -> Self {
        self.error_handling.fallback_value = Some(value);
        self
    }

    /// Sets the rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Sets the circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Sets authentication.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets the token provider used by bearer and OAuth2 auth.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.hooks.token_provider = Some(provider);
        self
    }

    /// Sets the request transform.
    #[must_use]
    pub fn with_request_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.hooks.request_transform = Some(Arc::new(f));
        self
    }

    /// Sets the response transform.
    #[must_use]
    pub fn with_response_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.hooks.response_transform = Some(Arc::new(f));
        self
    }

    /// Sets the response validator.
    #[must_use]
    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.hooks.validator = Some(Arc::new(f));
        self
    }

    /// Sets the terminal error transform.
    #[must_use]
    pub fn with_error_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(CallError) -> CallError + Send + Sync + 'static,
    {
        self.hooks.error_transform = Some(Arc::new(f));
        self
    }

    /// Appends a middleware.
    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.hooks.middlewares.add(middleware);
        self
    }

    /// Enables streaming with the given chunk handler.
    #[must_use]
    pub fn with_stream_handler(mut self, handler: ChunkHandler) -> Self {
        self.streaming.enabled = true;
        self.hooks.stream_handler = Some(handler);
        self
    }

    /// Returns the stream handler when streaming is enabled and one is set.
    #[must_use]
    pub fn stream_handler(&self) -> Option<ChunkHandler> {
        if self.streaming.enabled {
            self.hooks.stream_handler.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::AuthScheme;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_full_wire_shape() {
        let config: ExternalApiConfig = serde_json::from_value(serde_json::json!({
            "url": "https://api.example.com/v1/search",
            "method": "POST",
            "headers": {"Accept": "application/json"},
            "timeout": 5000,
            "retryConfig": {"maxRetries": 2, "backoffMs": 100, "maxBackoffMs": 1000},
            "errorHandling": {"retryOnStatus": [503], "fallbackValue": {"results": []}},
            "rateLimit": {"maxRequestsPerSecond": 10, "keyPrefix": "search:"},
            "circuitBreaker": {"failureThreshold": 3, "resetTimeoutMs": 10000, "fallbackService": "cache"},
            "auth": {"type": "bearer", "credentials": {"token": "t"}, "retryOnAuthFailure": true},
            "streaming": {"enabled": false}
        }))
        .unwrap();

        assert_eq!(config.method, "POST");
        assert_eq!(config.timeout_ms, Some(5000));
        assert_eq!(config.retry_config, RetryConfig::new(2, 100, 1000));
        assert_eq!(config.error_handling.retry_on_status, vec![503]);
        assert_eq!(config.error_handling.fallback_value, Some(serde_json::json!({"results": []})));
        assert_eq!(config.rate_limit.unwrap().max_requests_per_second, Some(10));
        assert_eq!(config.circuit_breaker.unwrap().fallback_service.as_deref(), Some("cache"));
        let auth = config.auth.unwrap();
        assert_eq!(auth.scheme, AuthScheme::Bearer);
        assert!(auth.retry_on_auth_failure);
    }

    #[test]
    fn test_minimal_wire_shape_defaults() {
        let config: ExternalApiConfig =
            serde_json::from_value(serde_json::json!({"url": "http://x"})).unwrap();
        assert_eq!(config.method, "GET");
        assert_eq!(config.retry_config, RetryConfig::default());
        assert_eq!(config.error_handling.retry_on_status, vec![408, 429, 500, 502, 503, 504]);
        assert!(config.circuit_breaker.is_none());
        assert!(config.stream_handler().is_none());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let retry = RetryConfig::new(5, 100, 350);
        assert_eq!(retry.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_retry(3), Duration::from_millis(350));
    }

    #[test]
    fn test_builder_hooks() {
        let config = ExternalApiConfig::new("http://x")
            .with_method("post")
            .with_validator(|v| v.is_object())
            .with_stream_handler(Arc::new(|_| {}));
        assert_eq!(config.method, "POST");
        assert!(config.hooks.validator.is_some());
        assert!(config.stream_handler().is_some());
        assert!(format!("{:?}", config.hooks).contains("validator: true"));
    }
}
