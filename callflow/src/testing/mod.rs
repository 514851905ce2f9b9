//! Test doubles for callflow registries and pipelines.
//!
//! This module provides:
//! - A scripted HTTP transport
//! - Echo agents and an agent service
//! - Fixed resource metrics
//! - Ready-made echo services

mod fixtures;
mod mocks;

pub use fixtures::{echo_registry, echo_service, StaticMetricsProvider};
pub use mocks::{EchoAgent, EchoAgentService, MockTransport};
