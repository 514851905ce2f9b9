//! Logging setup, span timing and resource metrics.

mod logging;
mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanTimer};
pub use metrics::{MetricsProvider, NullMetricsProvider, ResourceUsage};
