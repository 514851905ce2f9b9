//! Contracts for work the pipeline executor delegates elsewhere.
//!
//! Chain execution and agent/team services live outside this crate; the
//! executor only depends on these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of an agent or team run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Whether the run succeeded.
    pub success: bool,
    /// The produced result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Executes a chain definition.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainExecutor: Send + Sync {
    /// Runs `chain` with `input`.
    async fn execute_chain(
        &self,
        chain: serde_json::Value,
        input: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// A runnable agent or team.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Agent: Send + Sync {
    /// Runs a natural-language task.
    async fn run(&self, task: String) -> RunOutcome;
}

/// Looks up or creates agents (or teams) by name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Returns an existing agent.
    async fn get(&self, name: String) -> Option<Arc<dyn Agent>>;

    /// Creates an agent from a configuration object.
    async fn create(&self, config: serde_json::Value) -> anyhow::Result<Arc<dyn Agent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mocked_agent_service() {
        let mut agent = MockAgent::new();
        agent
            .expect_run()
            .withf(|task| task == "summarize")
            .returning(|_| RunOutcome::ok(serde_json::json!("done")));
        let agent: Arc<dyn Agent> = Arc::new(agent);

        let mut service = MockAgentService::new();
        service.expect_get().returning(move |_| Some(agent.clone()));

        let found = service.get("writer".to_string()).await.unwrap();
        let outcome = found.run("summarize".to_string()).await;
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(serde_json::json!("done")));
    }

    #[test]
    fn test_outcome_wire_shape() {
        let json = serde_json::to_value(RunOutcome::failed("nope")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "nope"}));
    }
}
