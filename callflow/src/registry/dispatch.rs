//! The service registry and its call-dispatch path.

use super::envelope::{CallMetrics, CallResult};
use super::external::ExternalApiConfig;
use super::middleware::MiddlewareContext;
use super::service::{handler_error, RegisteredService, ServiceHealth, ServiceMetadata, ServiceStatus};
use super::transport::{ChunkHandler, HttpRequest, HttpResponse, HttpTransport, NoTransport};
use crate::cancellation::CancellationToken;
use crate::errors::{CallError, ErrorCode, TransportError};
use crate::events::{ContextSink, NoOpContextSink};
use crate::observability::{MetricsProvider, NullMetricsProvider, SpanTimer};
use crate::resilience::{
    AuthHandler, BreakerPermit, CircuitBreaker, CircuitSnapshot, KeyedStore, RateLimiter,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_health_history_weight() -> f64 {
    0.9
}

fn default_max_fallback_depth() -> u8 {
    3
}

/// Registry-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Per-attempt timeout for external methods that do not set one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Weight kept by the previous health figures on each update.
    #[serde(default = "default_health_history_weight")]
    pub health_history_weight: f64,
    /// How many circuit-breaker fallback redirects one call may follow.
    #[serde(default = "default_max_fallback_depth")]
    pub max_fallback_depth: u8,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            health_history_weight: default_health_history_weight(),
            max_fallback_depth: default_max_fallback_depth(),
        }
    }
}

#[derive(Debug)]
struct ServiceEntry {
    service: Arc<RegisteredService>,
    status: ServiceStatus,
    health: ServiceHealth,
}

struct Dispatched {
    outcome: Result<serde_json::Value, CallError>,
    attempts: Option<u32>,
}

enum ExternalOutcome {
    Completed {
        outcome: Result<serde_json::Value, CallError>,
        attempts: u32,
    },
    Redirected(Dispatched),
}

impl ExternalOutcome {
    fn done(outcome: Result<serde_json::Value, CallError>, attempts: u32) -> Self {
        Self::Completed { outcome, attempts }
    }
}

/// Holds registered services and dispatches calls to them.
///
/// Local methods are invoked directly. External methods run through rate
/// limiting, circuit breaking, authentication, middleware and an HTTP retry
/// loop. Protection instances are created per endpoint URL on first use.
pub struct ServiceRegistry {
    config: RegistryConfig,
    services: DashMap<String, ServiceEntry>,
    transport: Arc<dyn HttpTransport>,
    sink: Arc<dyn ContextSink>,
    metrics: Arc<dyn MetricsProvider>,
    rate_limiters: KeyedStore<RateLimiter>,
    breakers: KeyedStore<CircuitBreaker>,
    auth_handlers: KeyedStore<AuthHandler>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("config", &self.config)
            .field("services", &self.services.len())
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry with the default HTTP transport.
    #[must_use]
    pub fn new() -> Self {
        #[cfg(feature = "http")]
        let transport: Arc<dyn HttpTransport> = Arc::new(super::transport::ReqwestTransport::new());
        #[cfg(not(feature = "http"))]
        let transport: Arc<dyn HttpTransport> = Arc::new(NoTransport);

        Self {
            config: RegistryConfig::default(),
            services: DashMap::new(),
            transport,
            sink: Arc::new(NoOpContextSink),
            metrics: Arc::new(NullMetricsProvider),
            rate_limiters: KeyedStore::new(),
            breakers: KeyedStore::new(),
            auth_handlers: KeyedStore::new(),
        }
    }

    /// Creates a registry that rejects every external call.
    #[must_use]
    pub fn without_http() -> Self {
        Self::new().with_transport(Arc::new(NoTransport))
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the context sink.
    #[must_use]
    pub fn with_context_sink(mut self, sink: Arc<dyn ContextSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the metrics provider.
    #[must_use]
    pub fn with_metrics_provider(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers a service.
    ///
    /// # Errors
    ///
    /// Returns `REGISTRATION_FAILED` if metadata is incomplete, the service
    /// has no methods, or the id is taken. A rejected registration leaves the
    /// existing entry untouched.
    pub fn register_service(&self, service: RegisteredService) -> Result<(), CallError> {
        service.metadata.validate()?;
        if service.method_count() == 0 {
            return Err(CallError::new(
                ErrorCode::RegistrationFailed,
                format!("Service '{}' declares no methods", service.id()),
            ));
        }

        let id = service.id().to_string();
        let summary = serde_json::json!({
            "event": "registered",
            "name": service.metadata.name,
            "version": service.metadata.version,
            "type": service.metadata.service_type,
        });

        match self.services.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(CallError::new(
                    ErrorCode::RegistrationFailed,
                    format!("Service '{id}' is already registered"),
                )
                .with_detail("service_id", serde_json::json!(id)));
            }
            Entry::Vacant(slot) => {
                let status = service.metadata.status;
                slot.insert(ServiceEntry {
                    service: Arc::new(service),
                    status,
                    health: ServiceHealth::default(),
                });
            }
        }

        info!(service_id = %id, "Service registered");
        self.sink.update_service_context(&id, summary);
        Ok(())
    }

    /// Removes a service, returning it if it was registered.
    pub fn unregister_service(&self, service_id: &str) -> Option<Arc<RegisteredService>> {
        let (_, entry) = self.services.remove(service_id)?;
        info!(service_id, "Service unregistered");
        self.sink
            .update_service_context(service_id, serde_json::json!({"event": "unregistered"}));
        Some(entry.service)
    }

    /// Returns a registered service.
    #[must_use]
    pub fn get_service(&self, service_id: &str) -> Option<Arc<RegisteredService>> {
        self.services.get(service_id).map(|e| e.service.clone())
    }

    /// Lists every registered service's metadata, ordered by id, with its
    /// current status.
    #[must_use]
    pub fn list_services(&self) -> Vec<ServiceMetadata> {
        let mut list: Vec<ServiceMetadata> = self
            .services
            .iter()
            .map(|e| {
                let mut meta = e.service.metadata.clone();
                meta.status = e.status;
                meta
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Returns a service's health record.
    #[must_use]
    pub fn get_service_health(&self, service_id: &str) -> Option<ServiceHealth> {
        self.services.get(service_id).map(|e| e.health.clone())
    }

    /// Returns the circuit breaker state for an endpoint URL, if one exists.
    #[must_use]
    pub fn circuit_state(&self, url: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(url).map(|b| b.snapshot())
    }

    /// Calls a service method.
    pub async fn execute_call(
        &self,
        service_id: &str,
        method: &str,
        request: serde_json::Value,
    ) -> CallResult {
        self.execute_call_with_token(service_id, method, request, &CancellationToken::new())
            .await
    }

    /// Calls a service method, aborting when `cancel` fires.
    pub async fn execute_call_with_token(
        &self,
        service_id: &str,
        method: &str,
        request: serde_json::Value,
        cancel: &CancellationToken,
    ) -> CallResult {
        let timer = SpanTimer::start(format!("{service_id}.{method}"));
        let dispatched = self.dispatch(service_id, method, request, cancel, 0).await;

        let mut metrics = CallMetrics::from_timer(timer, self.metrics.sample());
        if let Some(attempts) = dispatched.attempts {
            metrics = metrics.with_attempts(attempts);
        }

        let context = serde_json::json!({
            "method": method,
            "duration": metrics.duration,
            "attempts": dispatched.attempts,
        });
        match dispatched.outcome {
            Ok(data) => {
                debug!(service_id, method, duration_ms = metrics.duration, "Call succeeded");
                self.sink.record_execution_context(service_id, context);
                CallResult::ok(data, metrics)
            }
            Err(error) => {
                warn!(service_id, method, code = %error.code, error = %error.message, "Call failed");
                self.sink.record_error_context(service_id, &error, context);
                CallResult::err(error, metrics)
            }
        }
    }

    fn dispatch<'a>(
        &'a self,
        service_id: &'a str,
        method: &'a str,
        request: serde_json::Value,
        cancel: &'a CancellationToken,
        depth: u8,
    ) -> BoxFuture<'a, Dispatched> {
        async move {
            let Some(service) = self.get_service(service_id) else {
                return Dispatched {
                    outcome: Err(CallError::service_not_found(service_id)),
                    attempts: None,
                };
            };

            let started = tokio::time::Instant::now();
            let dispatched = if let Some(config) = service.external.get(method) {
                match self
                    .call_external(&service, method, config, request, cancel, depth)
                    .await
                {
                    ExternalOutcome::Completed { outcome, attempts } => Dispatched {
                        outcome,
                        attempts: Some(attempts),
                    },
                    // The redirect target already recorded its own health.
                    ExternalOutcome::Redirected(inner) => return inner,
                }
            } else if let Some(handler) = service.methods.get(method) {
                let outcome = tokio::select! {
                    result = handler.invoke(request) => result.map_err(handler_error),
                    () = cancel.cancelled() => Err(CallError::cancelled(
                        cancel.reason().unwrap_or_else(|| "call cancelled".to_string()),
                    )),
                };
                Dispatched {
                    outcome,
                    attempts: None,
                }
            } else {
                return Dispatched {
                    outcome: Err(CallError::method_not_found(service_id, method)),
                    attempts: None,
                };
            };

            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.record_health(service_id, dispatched.outcome.is_ok(), latency_ms);
            dispatched
        }
        .boxed()
    }

    fn record_health(&self, service_id: &str, success: bool, latency_ms: u64) {
        let transition = {
            let Some(mut entry) = self.services.get_mut(service_id) else {
                return;
            };
            entry
                .health
                .record(success, latency_ms, self.config.health_history_weight);
            let unhealthy = entry.health.status == super::service::HealthStatus::Unhealthy;
            match (entry.status, unhealthy) {
                (ServiceStatus::Active, true) => {
                    entry.status = ServiceStatus::Error;
                    Some((ServiceStatus::Error, entry.health.success_rate))
                }
                (ServiceStatus::Error, false) => {
                    entry.status = ServiceStatus::Active;
                    Some((ServiceStatus::Active, entry.health.success_rate))
                }
                _ => None,
            }
        };

        if let Some((status, success_rate)) = transition {
            warn!(service_id, ?status, success_rate, "Service status changed");
            self.sink.update_service_context(
                service_id,
                serde_json::json!({"event": "status_changed", "status": status, "successRate": success_rate}),
            );
        }
    }

    async fn call_external(
        &self,
        service: &RegisteredService,
        method: &str,
        config: &ExternalApiConfig,
        request: serde_json::Value,
        cancel: &CancellationToken,
        depth: u8,
    ) -> ExternalOutcome {
        let url = config.url.as_str();
        let hooks = &config.hooks;

        if let Some(limit) = &config.rate_limit {
            let limiter = self
                .rate_limiters
                .get_or_insert_with(&limit.key_for(url), || RateLimiter::new(limit.clone()));
            tokio::select! {
                () = limiter.acquire() => {}
                () = cancel.cancelled() => {
                    return ExternalOutcome::done(Err(CallError::cancelled("cancelled while rate limited")), 0);
                }
            }
        }

        let breaker = config
            .circuit_breaker
            .as_ref()
            .map(|cb| self.breakers.get_or_insert_with(url, || CircuitBreaker::new(cb.clone())));
        // Every return below settles the permit or drops it, which hands a
        // half-open trial slot back.
        let mut permit = match &breaker {
            Some(breaker) => match breaker.admit() {
                Some(permit) => Some(permit),
                None => {
                    return match breaker.config().fallback_service.as_deref() {
                        Some(fallback) if depth < self.config.max_fallback_depth => {
                            warn!(url, fallback, "Circuit open, redirecting to fallback service");
                            ExternalOutcome::Redirected(
                                self.dispatch(fallback, method, request, cancel, depth + 1).await,
                            )
                        }
                        _ => ExternalOutcome::done(Err(CallError::circuit_open(url)), 0),
                    };
                }
            },
            None => None,
        };

        let mut ctx = MiddlewareContext::new(service.id(), method, url);
        let auth = config.auth.as_ref().map(|a| {
            self.auth_handlers
                .get_or_insert_with(url, || AuthHandler::new(a.clone(), hooks.token_provider.clone()))
        });
        let mut auth_headers = match &auth {
            Some(handler) => match handler.get_auth_headers().await {
                Ok(headers) => headers,
                Err(e) => return ExternalOutcome::done(self.recover(config, &ctx, e.into()).await, 0),
            },
            None => HashMap::new(),
        };

        let mut payload = match hooks.middlewares.run_pre(&ctx, request).await {
            Ok(payload) => payload,
            Err(e) => return ExternalOutcome::done(self.recover(config, &ctx, e).await, 0),
        };
        if let Some(transform) = &hooks.request_transform {
            payload = transform(payload);
        }

        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(self.config.default_timeout_ms));
        let retry = &config.retry_config;
        let mut retries_used = 0;
        let mut auth_replayed = false;
        let mut attempts = 0;

        loop {
            attempts += 1;
            ctx.attempt = attempts;
            let request = build_request(config, &auth_headers, &payload, timeout);
            let sent = self
                .send_with_timeout(request, config.stream_handler(), timeout, cancel)
                .await;

            match sent {
                Ok(response)
                    if response.status == 401
                        && !auth_replayed
                        && auth.as_ref().is_some_and(|h| h.config().retry_on_auth_failure) =>
                {
                    auth_replayed = true;
                    info!(url, "Received 401, refreshing credentials and replaying once");
                    let refreshed = match &auth {
                        Some(handler) => match handler.refresh_auth().await {
                            Ok(()) => handler.get_auth_headers().await,
                            Err(e) => Err(e),
                        },
                        None => Ok(HashMap::new()),
                    };
                    match refreshed {
                        Ok(headers) => auth_headers = headers,
                        Err(e) => {
                            return ExternalOutcome::done(Err(self.terminal(config, e.into())), attempts)
                        }
                    }
                }
                Ok(response) if response.is_success() => {
                    let outcome = self
                        .complete_success(config, &ctx, response, permit.as_mut())
                        .await;
                    return ExternalOutcome::done(outcome, attempts);
                }
                Ok(response) => {
                    let status = response.status;
                    if config.error_handling.retry_on_status.contains(&status)
                        && retries_used < retry.max_retries
                    {
                        retries_used += 1;
                        let delay = retry.delay_for_retry(retries_used);
                        debug!(url, status, attempt = attempts, delay_ms = delay.as_millis() as u64, "Retrying after error status");
                        if !cancel.sleep(delay).await {
                            return ExternalOutcome::done(Err(CallError::cancelled("cancelled during backoff")), attempts);
                        }
                        continue;
                    }

                    if let Some(permit) = permit.as_mut() {
                        permit.fail();
                    }
                    if let Some(fallback) = &config.error_handling.fallback_value {
                        warn!(url, status, "Returning configured fallback value");
                        return ExternalOutcome::done(Ok(fallback.clone()), attempts);
                    }
                    let error = CallError::new(
                        ErrorCode::HttpError,
                        format!("{} {url} returned status {status}", config.method),
                    )
                    .with_detail("status", serde_json::json!(status))
                    .with_detail("body", response.body);
                    return ExternalOutcome::done(Err(self.terminal(config, error)), attempts);
                }
                Err(TransportError::Cancelled(reason)) => {
                    return ExternalOutcome::done(Err(CallError::cancelled(reason)), attempts);
                }
                Err(err) => {
                    let error = CallError::from(err);
                    if let Some(recovered) = hooks.middlewares.run_error(&ctx, &error).await {
                        return ExternalOutcome::done(Ok(recovered), attempts);
                    }
                    if retries_used < retry.max_retries {
                        retries_used += 1;
                        let delay = retry.delay_for_retry(retries_used);
                        debug!(url, attempt = attempts, error = %error.message, delay_ms = delay.as_millis() as u64, "Retrying after transport error");
                        if !cancel.sleep(delay).await {
                            return ExternalOutcome::done(Err(CallError::cancelled("cancelled during backoff")), attempts);
                        }
                        continue;
                    }
                    if let Some(permit) = permit.as_mut() {
                        permit.fail();
                    }
                    return ExternalOutcome::done(Err(self.terminal(config, error)), attempts);
                }
            }
        }
    }

    async fn send_with_timeout(
        &self,
        request: HttpRequest,
        stream_handler: Option<ChunkHandler>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let attempt_token = cancel.child_token();
        let send = match stream_handler {
            Some(handler) => self.transport.send_streaming(request, &attempt_token, handler),
            None => self.transport.send(request, &attempt_token),
        };
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        tokio::select! {
            result = send => result,
            () = tokio::time::sleep(timeout) => {
                attempt_token.cancel(format!("request timed out after {timeout_ms}ms"));
                Err(TransportError::Timeout { timeout_ms })
            }
            () = cancel.cancelled() => Err(TransportError::Cancelled(
                cancel.reason().unwrap_or_else(|| "call cancelled".to_string()),
            )),
        }
    }

    async fn complete_success(
        &self,
        config: &ExternalApiConfig,
        ctx: &MiddlewareContext,
        response: HttpResponse,
        permit: Option<&mut BreakerPermit<'_>>,
    ) -> Result<serde_json::Value, CallError> {
        let hooks = &config.hooks;
        let mut body = response.body;
        if let Some(transform) = &hooks.response_transform {
            body = transform(body);
        }
        if let Some(validator) = &hooks.validator {
            if !validator(&body) {
                if let Some(permit) = permit {
                    permit.fail();
                }
                let error = CallError::new(
                    ErrorCode::ValidationFailed,
                    format!("Response from {} failed validation", config.url),
                );
                return Err(self.terminal(config, error));
            }
        }
        let body = hooks.middlewares.run_post(ctx, body).await?;
        if let Some(permit) = permit {
            permit.succeed();
        }
        Ok(body)
    }

    /// Gives error middleware a chance to recover a failure raised before any request was sent.
    async fn recover(
        &self,
        config: &ExternalApiConfig,
        ctx: &MiddlewareContext,
        error: CallError,
    ) -> Result<serde_json::Value, CallError> {
        match config.hooks.middlewares.run_error(ctx, &error).await {
            Some(recovered) => {
                debug!(url = %config.url, "Error middleware recovered a pre-request failure");
                Ok(recovered)
            }
            None => Err(self.terminal(config, error)),
        }
    }

    #[allow(clippy::unused_self)]
    fn terminal(&self, config: &ExternalApiConfig, error: CallError) -> CallError {
        match &config.hooks.error_transform {
            Some(transform) => transform(error),
            None => error,
        }
    }
}

fn build_request(
    config: &ExternalApiConfig,
    auth_headers: &HashMap<String, String>,
    payload: &serde_json::Value,
    timeout: Duration,
) -> HttpRequest {
    let mut request = HttpRequest::new(config.method.clone(), config.url.clone()).with_timeout(timeout);
    request.headers.extend(config.headers.clone());
    request.headers.extend(auth_headers.clone());
    if !payload.is_null() && config.method != "GET" && config.method != "HEAD" {
        request.body = Some(payload.clone());
    }
    request
}
