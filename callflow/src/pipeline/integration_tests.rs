//! Cross-module scenarios: executor, intelligence and registry together.

#[cfg(test)]
mod tests {
    use crate::errors::ErrorCode;
    use crate::events::{CollectingContextSink, ContextEventKind};
    use crate::pipeline::{
        EnhancedRetryPolicy, ErrorStrategy, ExecutionStatus, IntelligenceConfig,
        PipelineDefinition, PipelineExecutor, PipelineIntelligence, PipelineStepDefinition,
    };
    use crate::registry::{
        method_fn, ExternalApiConfig, RegisteredService, RetryConfig, ServiceMetadata,
        ServiceRegistry, ServiceType,
    };
    use crate::testing::{echo_service, EchoAgent, EchoAgentService, MockTransport};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const URL: &str = "https://api.example.com/v1/search";

    fn single_attempt() -> Arc<PipelineIntelligence> {
        Arc::new(PipelineIntelligence::new(IntelligenceConfig {
            default_policy: EnhancedRetryPolicy::new().with_max_retries(0),
            ..IntelligenceConfig::default()
        }))
    }

    fn counting_service(id: &str, calls: &Arc<AtomicUsize>) -> RegisteredService {
        let counter = Arc::clone(calls);
        RegisteredService::new(ServiceMetadata::new(id, id, "1.0.0", ServiceType::Tool)).with_method(
            "run",
            method_fn(move |request| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(request) }
            }),
        )
    }

    fn registry_with(services: Vec<RegisteredService>) -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::without_http();
        for service in services {
            registry.register_service(service).unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_stop_strategy_halts_after_failed_step() {
        let registry = registry_with(vec![echo_service("echo")]);
        let def = PipelineDefinition::new("three")
            .with_strategy(ErrorStrategy::Stop)
            .with_step(PipelineStepDefinition::tool("one", "echo", "echo"))
            .with_step(PipelineStepDefinition::tool("two", "echo", "fail"))
            .with_step(PipelineStepDefinition::tool("three", "echo", "echo"));

        let result = PipelineExecutor::new(def, registry)
            .with_intelligence(single_attempt())
            .execute(serde_json::Value::Null)
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failure_count(), 1);
        assert!(result.step("two").unwrap().failed());
        assert!(result.step("three").is_none());
        assert_eq!(result.error.unwrap().message, "echo service failure");
    }

    #[tokio::test]
    async fn test_unknown_dependency_fails_before_any_step_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(vec![counting_service("counter", &calls)]);
        let def = PipelineDefinition::new("broken")
            .with_step(PipelineStepDefinition::tool("a", "counter", "run"))
            .with_step(PipelineStepDefinition::tool("b", "counter", "run").with_dependency("z"));

        let result = PipelineExecutor::new(def, registry).execute(serde_json::Value::Null).await;

        assert!(!result.success);
        assert!(result.result.steps.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::InvalidInput);
        assert!(error.message.contains("unknown step 'z'"));
    }

    #[tokio::test]
    async fn test_continue_on_error_isolates_failure() {
        let registry = registry_with(vec![echo_service("echo")]);
        let def = PipelineDefinition::new("isolated")
            .with_step(PipelineStepDefinition::tool("flaky", "echo", "fail").continue_on_error())
            .with_step(
                PipelineStepDefinition::tool("after", "echo", "echo")
                    .with_input("ok", serde_json::json!(true)),
            );

        let result = PipelineExecutor::new(def, registry)
            .with_intelligence(single_attempt())
            .execute(serde_json::Value::Null)
            .await;

        assert!(result.success);
        assert!(result.step("flaky").unwrap().failed());
        assert_eq!(result.result.output, Some(serde_json::json!({"ok": true})));
        assert_eq!(result.metrics.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_step_failure_is_retried_with_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flaky = RegisteredService::new(ServiceMetadata::new("net", "net", "1.0.0", ServiceType::Tool))
            .with_method(
                "get",
                method_fn(move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(anyhow::anyhow!("connection reset"))
                        } else {
                            Ok(serde_json::json!("done"))
                        }
                    }
                }),
            );
        let registry = registry_with(vec![flaky]);
        let def = PipelineDefinition::new("retry").with_step(PipelineStepDefinition::tool("fetch", "net", "get"));

        let start = tokio::time::Instant::now();
        let result = PipelineExecutor::new(def, registry).execute(serde_json::Value::Null).await;

        assert!(result.success);
        let step = result.step("fetch").unwrap();
        assert_eq!(step.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of default exponential backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_step_bounded_fan_out() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (now, max) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let slow = RegisteredService::new(ServiceMetadata::new("slow", "slow", "1.0.0", ServiceType::Tool))
            .with_method(
                "work",
                method_fn(move |request| {
                    let (now, max) = (Arc::clone(&now), Arc::clone(&max));
                    async move {
                        let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                        max.fetch_max(current, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        now.fetch_sub(1, Ordering::SeqCst);
                        Ok(request)
                    }
                }),
            );
        let registry = registry_with(vec![slow]);

        let subs = (1..=4)
            .map(|i| {
                PipelineStepDefinition::tool(format!("s{i}"), "slow", "work")
                    .with_input("n", serde_json::json!(i))
            })
            .collect();
        let def = PipelineDefinition::new("fan")
            .with_max_parallel(2)
            .with_step(PipelineStepDefinition::parallel("all", subs))
            .with_step(
                PipelineStepDefinition::tool("after", "slow", "work")
                    .with_input("third", serde_json::json!("@all.s3.n"))
                    .with_dependency("s3"),
            );

        let start = tokio::time::Instant::now();
        let result = PipelineExecutor::new(def, registry)
            .with_intelligence(single_attempt())
            .execute(serde_json::Value::Null)
            .await;

        assert!(result.success);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(result.step("s2").unwrap().success);
        assert_eq!(
            result.step("all").unwrap().result.as_ref().unwrap()["s4"],
            serde_json::json!({"n": 4})
        );
        assert_eq!(result.result.output, Some(serde_json::json!({"third": 3})));
        let ids: Vec<_> = result.result.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3", "s4", "all", "after"]);
    }

    #[tokio::test]
    async fn test_parallel_step_fails_when_required_sub_step_fails() {
        let registry = registry_with(vec![echo_service("echo")]);
        let def = PipelineDefinition::new("fan").with_step(PipelineStepDefinition::parallel(
            "all",
            vec![
                PipelineStepDefinition::tool("good", "echo", "echo"),
                PipelineStepDefinition::tool("tolerated", "echo", "fail").continue_on_error(),
                PipelineStepDefinition::tool("bad", "echo", "fail"),
            ],
        ));

        let result = PipelineExecutor::new(def, registry)
            .with_intelligence(single_attempt())
            .execute(serde_json::Value::Null)
            .await;

        assert!(!result.success);
        let error = result.error.as_ref().unwrap();
        assert!(error.message.contains("sub-step 'bad'"));
        assert_eq!(error.details["subStep"], "bad");
        assert!(result.step("good").unwrap().success);
        assert_eq!(result.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_fallback_pipeline_runs_with_current_variables() {
        let registry = registry_with(vec![echo_service("echo")]);
        let fallback = PipelineDefinition::new("backup").with_step(
            PipelineStepDefinition::tool("cached", "echo", "echo")
                .with_input("topic", serde_json::json!("$topic")),
        );
        let def = PipelineDefinition::new("primary")
            .with_variable("topic", serde_json::json!("rust"))
            .with_fallback(fallback)
            .with_step(PipelineStepDefinition::tool("live", "echo", "fail"))
            .with_step(PipelineStepDefinition::tool("never", "echo", "echo"));

        let result = PipelineExecutor::new(def, registry)
            .with_intelligence(single_attempt())
            .execute(serde_json::Value::Null)
            .await;

        assert!(result.success);
        assert!(result.fallback_used);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.result.output, Some(serde_json::json!({"topic": "rust"})));
        assert!(result.step("live").unwrap().failed());
        assert!(result.step("never").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_pipeline_over_external_endpoint() {
        let transport = Arc::new(MockTransport::new());
        transport.push_status(503, serde_json::json!("busy"));
        transport.push_status(200, serde_json::json!({"results": [{"title": "The Book"}]}));

        let registry = ServiceRegistry::new().with_transport(transport.clone());
        let config = ExternalApiConfig::new(URL)
            .with_method("POST")
            .with_retry(RetryConfig::new(2, 100, 1000));
        registry
            .register_service(
                RegisteredService::new(ServiceMetadata::new("search", "Search", "1.0.0", ServiceType::Tool))
                    .with_external("query", config),
            )
            .unwrap();

        let def = PipelineDefinition::from_json(
            r#"{
                "id": "research",
                "variables": {"topic": "rust"},
                "steps": [
                    {"id": "lookup", "type": "tool", "tool": {"serviceId": "search", "method": "query"},
                     "inputs": {"q": "$topic", "limit": 1},
                     "outputs": {"title": "results[0].title"}},
                    {"id": "shout", "type": "transform", "transform": {"operation": "uppercase"},
                     "inputs": {"input": "$title"}, "dependencies": ["lookup"]}
                ]
            }"#,
        )
        .unwrap();

        let result = PipelineExecutor::new(def, Arc::new(registry))
            .execute(serde_json::Value::Null)
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result.output, Some(serde_json::json!("THE BOOK")));
        assert_eq!(result.step("lookup").unwrap().retry_count, 0);
        assert_eq!(transport.request_count(), 2);
        assert_eq!(
            transport.requests()[1].body,
            Some(serde_json::json!({"q": "rust", "limit": 1}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_aborts_slow_external_call() {
        let transport = Arc::new(MockTransport::new());
        transport.push_delayed(Duration::from_secs(10), 200, serde_json::json!("late"));

        let registry = ServiceRegistry::new().with_transport(transport.clone());
        registry
            .register_service(
                RegisteredService::new(ServiceMetadata::new("api", "api", "1.0.0", ServiceType::Tool))
                    .with_external("fetch", ExternalApiConfig::new(URL)),
            )
            .unwrap();
        let def = PipelineDefinition::new("slow")
            .with_step(PipelineStepDefinition::tool("call", "api", "fetch").with_timeout_ms(50));

        let start = tokio::time::Instant::now();
        let result = PipelineExecutor::new(def, Arc::new(registry))
            .with_intelligence(single_attempt())
            .execute(serde_json::Value::Null)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::Timeout);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_agent_and_team_steps_with_context_events() {
        let registry = registry_with(vec![]);
        let agents = Arc::new(EchoAgentService::new().with_agent(EchoAgent::new("writer")));
        let teams = Arc::new(EchoAgentService::new());
        let sink = Arc::new(CollectingContextSink::new());

        let def = PipelineDefinition::from_json(
            r#"{
                "id": "delegation",
                "steps": [
                    {"id": "draft", "type": "agent", "agent": {"name": "writer"},
                     "inputs": {"task": "$topic"}, "outputs": {"draft": "task"}},
                    {"id": "review", "type": "team", "team": {"config": {"name": "reviewers"}},
                     "inputs": {"query": "$draft"}}
                ]
            }"#,
        )
        .unwrap();

        let result = PipelineExecutor::new(def, registry)
            .with_agent_service(agents.clone())
            .with_team_service(teams.clone())
            .with_context_sink(sink.clone())
            .execute(serde_json::json!({"topic": "ownership"}))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.result.output,
            Some(serde_json::json!({"agent": "reviewers", "task": "ownership"}))
        );
        assert_eq!(agents.agent("writer").unwrap().runs(), 1);
        assert_eq!(teams.created(), 1);
        assert_eq!(sink.events_of_kind(ContextEventKind::Execution).len(), 3);
        assert!(sink.events_of_kind(ContextEventKind::Error).is_empty());
    }
}
