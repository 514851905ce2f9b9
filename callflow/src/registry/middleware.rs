//! Ordered request/response middleware for external calls.

use crate::errors::CallError;
use async_trait::async_trait;
use std::sync::Arc;

/// What a middleware sees about the call it wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareContext {
    /// The service being called.
    pub service_id: String,
    /// The method being called.
    pub method: String,
    /// The endpoint URL.
    pub url: String,
    /// 1-based HTTP attempt number.
    pub attempt: u32,
}

impl MiddlewareContext {
    /// Creates a context for the first attempt.
    #[must_use]
    pub fn new(service_id: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            method: method.into(),
            url: url.into(),
            attempt: 1,
        }
    }
}

/// Hooks around an external call.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Returns the middleware name, used in logs.
    fn name(&self) -> &str {
        "middleware"
    }

    /// Transforms the request payload before it is sent.
    async fn pre(
        &self,
        _ctx: &MiddlewareContext,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        Ok(request)
    }

    /// Transforms the response payload after validation.
    async fn post(
        &self,
        _ctx: &MiddlewareContext,
        response: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        Ok(response)
    }

    /// Observes a failed attempt. Returning `Some` recovers the call with
    /// that payload.
    async fn on_error(
        &self,
        _ctx: &MiddlewareContext,
        _error: &CallError,
    ) -> Option<serde_json::Value> {
        None
    }
}

/// An ordered list of middleware.
///
/// `pre` hooks run in insertion order, `post` hooks in reverse, and
/// `on_error` hooks in insertion order until one recovers.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.middlewares.iter().map(|m| m.name()))
            .finish()
    }
}

impl MiddlewareChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Appends a middleware, builder style.
    #[must_use]
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add(middleware);
        self
    }

    /// Runs every `pre` hook.
    pub async fn run_pre(
        &self,
        ctx: &MiddlewareContext,
        mut request: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        for middleware in &self.middlewares {
            request = middleware.pre(ctx, request).await?;
        }
        Ok(request)
    }

    /// Runs every `post` hook.
    pub async fn run_post(
        &self,
        ctx: &MiddlewareContext,
        mut response: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        for middleware in self.middlewares.iter().rev() {
            response = middleware.post(ctx, response).await?;
        }
        Ok(response)
    }

    /// Offers the error to each `on_error` hook until one recovers.
    pub async fn run_error(
        &self,
        ctx: &MiddlewareContext,
        error: &CallError,
    ) -> Option<serde_json::Value> {
        for middleware in &self.middlewares {
            if let Some(recovered) = middleware.on_error(ctx, error).await {
                tracing::debug!(
                    middleware = middleware.name(),
                    service_id = %ctx.service_id,
                    "Middleware recovered failed call"
                );
                return Some(recovered);
            }
        }
        None
    }

    /// Returns the number of middleware.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Returns true if the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Tagging {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tagging {
        fn name(&self) -> &str {
            self.tag
        }

        async fn pre(
            &self,
            _ctx: &MiddlewareContext,
            mut request: serde_json::Value,
        ) -> Result<serde_json::Value, CallError> {
            self.log.lock().push(format!("pre:{}", self.tag));
            request[self.tag] = serde_json::json!(true);
            Ok(request)
        }

        async fn post(
            &self,
            _ctx: &MiddlewareContext,
            response: serde_json::Value,
        ) -> Result<serde_json::Value, CallError> {
            self.log.lock().push(format!("post:{}", self.tag));
            Ok(response)
        }
    }

    struct Recovering;

    #[async_trait]
    impl Middleware for Recovering {
        async fn on_error(
            &self,
            _ctx: &MiddlewareContext,
            error: &CallError,
        ) -> Option<serde_json::Value> {
            Some(serde_json::json!({"recovered": error.message}))
        }
    }

    struct Rejecting;

    #[async_trait]
    impl Middleware for Rejecting {
        async fn pre(
            &self,
            _ctx: &MiddlewareContext,
            _request: serde_json::Value,
        ) -> Result<serde_json::Value, CallError> {
            Err(CallError::invalid_input("blocked"))
        }
    }

    fn ctx() -> MiddlewareContext {
        MiddlewareContext::new("svc", "get", "http://example")
    }

    #[tokio::test]
    async fn test_pre_in_order_post_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(Arc::new(Tagging { tag: "a", log: log.clone() }))
            .with(Arc::new(Tagging { tag: "b", log: log.clone() }));

        let request = chain.run_pre(&ctx(), serde_json::json!({})).await.unwrap();
        assert_eq!(request, serde_json::json!({"a": true, "b": true}));

        chain.run_post(&ctx(), serde_json::Value::Null).await.unwrap();
        assert_eq!(*log.lock(), vec!["pre:a", "pre:b", "post:b", "post:a"]);
    }

    #[tokio::test]
    async fn test_pre_error_stops_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(Arc::new(Rejecting))
            .with(Arc::new(Tagging { tag: "a", log: log.clone() }));

        let err = chain.run_pre(&ctx(), serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.message, "blocked");
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_error_hook_recovers() {
        let empty = MiddlewareChain::new();
        assert!(empty.run_error(&ctx(), &CallError::execution("boom")).await.is_none());

        let chain = MiddlewareChain::new().with(Arc::new(Recovering));
        let recovered = chain.run_error(&ctx(), &CallError::execution("boom")).await;
        assert_eq!(recovered, Some(serde_json::json!({"recovered": "boom"})));
        assert_eq!(chain.len(), 1);
    }
}
