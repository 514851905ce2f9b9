//! Service registry and call dispatch.
//!
//! Services are registered with local method handlers and/or
//! [`ExternalApiConfig`]-backed remote methods. Every call returns a
//! [`CallResult`] envelope; failures never escape as panics or bare errors.
//!
//! ```text
//! execute_call ─► lookup ─┬─ local handler ───────────────────────────────┐
//!                         └─ external: rate limit ─► breaker ─► auth ─►    │
//!                              middleware.pre ─► retry loop ─► validate ─► │
//!                              middleware.post                             │
//!                                                health + context sink ◄───┘
//! ```

mod dispatch;
pub mod envelope;
pub mod external;
pub mod middleware;
pub mod service;
pub mod transport;

pub use dispatch::{RegistryConfig, ServiceRegistry};
pub use envelope::{CallMetrics, CallResult};
pub use external::{
    ErrorHandlingConfig, ErrorTransform, ExternalApiConfig, ExternalHooks, PayloadTransform,
    ResponseValidator, RetryConfig, StreamingConfig,
};
pub use middleware::{Middleware, MiddlewareChain, MiddlewareContext};
pub use service::{
    handler_error, method_fn, HealthStatus, ParameterSpec, RegisteredService, ServiceHealth,
    ServiceMetadata, ServiceMethod, ServiceStatus, ServiceType,
};
#[cfg(feature = "http")]
pub use transport::ReqwestTransport;
pub use transport::{decode_body, ChunkHandler, HttpRequest, HttpResponse, HttpTransport, NoTransport};
