//! # Callflow
//!
//! Resilient service dispatch and workflow execution.
//!
//! Callflow composes callable services into multi-step pipelines and invokes
//! them, including remote HTTP-backed ones, with:
//!
//! - **Service registry**: named services with local or external methods, health tracking
//! - **Layered protection**: rate limiting, circuit breaking, authentication, retry with backoff
//! - **Middleware**: ordered pre/post/error hooks around external calls
//! - **Pipelines**: declarative steps with dependencies, conditions, transforms and fan-out
//! - **Step intelligence**: per-step retry policies, breakers, timeouts and performance analysis
//! - **Cancellation**: tokens that actually abort in-flight calls
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use callflow::prelude::*;
//!
//! let registry = Arc::new(ServiceRegistry::new());
//! registry.register_service(
//!     RegisteredService::new(ServiceMetadata::new("search", "Search", "1.0.0", ServiceType::Tool))
//!         .with_external("query", ExternalApiConfig::new("https://api.example.com/search")),
//! )?;
//!
//! let pipeline = PipelineDefinition::new("research")
//!     .with_step(PipelineStepDefinition::tool("lookup", "search", "query")
//!         .with_input("q", json!("$topic")));
//!
//! let result = PipelineExecutor::new(pipeline, registry)
//!     .execute(json!({"topic": "rust"}))
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod collaborators;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::collaborators::{Agent, AgentService, ChainExecutor, RunOutcome};
    pub use crate::errors::{CallError, CallflowError, DefinitionError, ErrorCode};
    pub use crate::events::{ContextSink, LoggingContextSink, NoOpContextSink};
    pub use crate::observability::{init_logging, LoggingConfig};
    pub use crate::pipeline::{
        EnhancedRetryPolicy, ErrorStrategy, ExecutionStatus, PipelineDefinition,
        PipelineExecutor, PipelineIntelligence, PipelineResult, PipelineStepDefinition,
        StepKind,
    };
    pub use crate::registry::{
        method_fn, CallResult, ExternalApiConfig, Middleware, RegisteredService,
        ServiceMetadata, ServiceRegistry, ServiceType,
    };
    pub use crate::resilience::{
        AuthConfig, BackoffPolicy, CircuitBreakerConfig, RateLimitConfig,
    };
}
