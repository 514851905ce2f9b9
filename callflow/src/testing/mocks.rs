//! Test doubles for the HTTP transport and agent collaborators.

use crate::cancellation::CancellationToken;
use crate::collaborators::{Agent, AgentService, RunOutcome};
use crate::errors::TransportError;
use crate::registry::{HttpRequest, HttpResponse, HttpTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
enum Scripted {
    Respond(HttpResponse),
    Delayed(Duration, HttpResponse),
    Fail(TransportError),
}

/// A transport that replays scripted responses in order and records requests.
///
/// With an empty script every request gets `200` with a null body.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
    cancelled: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Creates a transport with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_status(&self, status: u16, body: serde_json::Value) {
        self.script
            .lock()
            .push_back(Scripted::Respond(HttpResponse::new(status, body)));
    }

    /// Queues a response delivered after `delay` unless the request is cancelled first.
    pub fn push_delayed(&self, delay: Duration, status: u16, body: serde_json::Value) {
        self.script
            .lock()
            .push_back(Scripted::Delayed(delay, HttpResponse::new(status, body)));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: TransportError) {
        self.script.lock().push_back(Scripted::Fail(error));
    }

    /// Number of requests received.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of delayed requests whose token was cancelled.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();

        match next {
            None => Ok(HttpResponse::new(200, serde_json::Value::Null)),
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Delayed(delay, response)) => {
                let counter = Arc::clone(&self.cancelled);
                cancel.on_cancel(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                if cancel.sleep(delay).await {
                    Ok(response)
                } else {
                    Err(TransportError::Cancelled(
                        cancel.reason().unwrap_or_else(|| "request cancelled".to_string()),
                    ))
                }
            }
        }
    }
}

/// An agent that echoes its task, or fails with a fixed error.
#[derive(Debug)]
pub struct EchoAgent {
    name: String,
    failure: Option<String>,
    runs: AtomicUsize,
}

impl EchoAgent {
    /// Creates an agent answering `{"agent": name, "task": task}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure: None,
            runs: AtomicUsize::new(0),
        }
    }

    /// Creates an agent whose runs fail with `error`.
    #[must_use]
    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            failure: Some(error.into()),
            ..Self::new(name)
        }
    }

    /// Number of runs.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&self, task: String) -> RunOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(error) => RunOutcome::failed(error.clone()),
            None => RunOutcome::ok(serde_json::json!({"agent": self.name, "task": task})),
        }
    }
}

/// An agent service over a fixed set of [`EchoAgent`]s.
///
/// `create` builds an [`EchoAgent`] named by the config's `name` field.
#[derive(Debug, Default)]
pub struct EchoAgentService {
    agents: Mutex<HashMap<String, Arc<EchoAgent>>>,
    created: AtomicUsize,
}

impl EchoAgentService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an agent.
    #[must_use]
    pub fn with_agent(self, agent: EchoAgent) -> Self {
        self.agents.lock().insert(agent.name.clone(), Arc::new(agent));
        self
    }

    /// Returns a known agent.
    #[must_use]
    pub fn agent(&self, name: &str) -> Option<Arc<EchoAgent>> {
        self.agents.lock().get(name).cloned()
    }

    /// Number of agents created from configs.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentService for EchoAgentService {
    async fn get(&self, name: String) -> Option<Arc<dyn Agent>> {
        self.agent(&name).map(|a| a as Arc<dyn Agent>)
    }

    async fn create(&self, config: serde_json::Value) -> anyhow::Result<Arc<dyn Agent>> {
        let name = config
            .get("name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("agent config requires a name"))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        let agent = Arc::new(EchoAgent::new(name));
        self.agents.lock().insert(name.to_string(), Arc::clone(&agent));
        Ok(agent as Arc<dyn Agent>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_replays_script_then_defaults() {
        let transport = MockTransport::new();
        transport.push_status(503, serde_json::json!("busy"));
        transport.push_error(TransportError::Network("reset".into()));
        let token = CancellationToken::new();

        let first = transport.send(HttpRequest::new("get", "http://x"), &token).await.unwrap();
        assert_eq!(first.status, 503);
        assert!(transport.send(HttpRequest::new("get", "http://x"), &token).await.is_err());
        let third = transport.send(HttpRequest::new("get", "http://x"), &token).await.unwrap();
        assert_eq!(third.status, 200);
        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.requests()[0].method, "GET");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_response_observes_cancellation() {
        let transport = MockTransport::new();
        transport.push_delayed(Duration::from_secs(5), 200, serde_json::Value::Null);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move { canceller.cancel("stop") });

        let err = transport.send(HttpRequest::new("get", "http://x"), &token).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled(reason) if reason == "stop"));
        assert_eq!(transport.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn test_echo_agent_service() {
        let service = EchoAgentService::new().with_agent(EchoAgent::failing("broken", "no"));

        assert!(service.get("missing".into()).await.is_none());
        let outcome = service.get("broken".into()).await.unwrap().run("x".into()).await;
        assert_eq!(outcome, RunOutcome::failed("no"));

        let created = service.create(serde_json::json!({"name": "w"})).await.unwrap();
        let outcome = created.run("hi".into()).await;
        assert_eq!(outcome.result, Some(serde_json::json!({"agent": "w", "task": "hi"})));
        assert_eq!(service.created(), 1);
        assert!(service.create(serde_json::json!({})).await.is_err());
    }
}
