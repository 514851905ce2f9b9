//! Context-event sink for execution, error and service-lifecycle records.
//!
//! Sinks are passed explicitly to the registry and executor; there is no
//! process-wide sink.

mod sink;

pub use sink::{
    CollectingContextSink, ContextEvent, ContextEventKind, ContextSink, LoggingContextSink,
    NoOpContextSink,
};
