//! Per-key protection primitives used on the call-dispatch path.
//!
//! - [`RateLimiter`]: sliding per-second / per-minute request throttle
//! - [`CircuitBreaker`]: three-state failure breaker
//! - [`AuthHandler`]: credential headers with single-flight token refresh
//! - [`BackoffPolicy`]: retry delay computation shared by the registry and
//!   the pipeline intelligence layer

pub mod auth;
pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use auth::{AuthConfig, AuthCredentials, AuthHandler, AuthScheme, TokenGrant, TokenProvider};
#[cfg(feature = "http")]
pub use auth::OAuth2TokenProvider;
pub use backoff::{BackoffPolicy, BackoffStrategy, CustomBackoff};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter};

use dashmap::DashMap;
use std::sync::Arc;

/// A lazily-populated store of per-key protection instances.
///
/// One instance is created per distinguishing key (endpoint URL, or
/// execution id plus step id) on first use and reused afterwards.
#[derive(Debug)]
pub struct KeyedStore<T> {
    entries: DashMap<String, Arc<T>>,
}

impl<T> Default for KeyedStore<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> KeyedStore<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instance for `key`, creating it with `init` if absent.
    pub fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.entries.get(key) {
            return existing.clone();
        }
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()))
            .clone()
    }

    /// Returns the instance for `key` if one exists.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Removes every key starting with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
