//! Retry delay computation with configurable backoff strategies.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A caller-supplied delay function, given the 1-based attempt number.
pub type CustomBackoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * attempt
    Linear,
    /// delay = base * multiplier^(attempt - 1)
    #[default]
    Exponential,
    /// Exponential delay plus up to `jitter_ratio` of extra random delay.
    Jittery,
    /// delay = base (constant)
    Fixed,
    /// Delay computed by a caller-supplied function.
    Custom,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.1
}

/// Backoff configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Strategy used to grow the delay.
    #[serde(default, rename = "type")]
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor for exponential and jittery strategies.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the exponential delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Delay function for [`BackoffStrategy::Custom`].
    #[serde(skip)]
    pub custom: Option<CustomBackoff>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            custom: None,
        }
    }
}

impl fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("strategy", &self.strategy)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("multiplier", &self.multiplier)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl BackoffPolicy {
    /// Creates a new policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an exponential policy with the given base and cap.
    #[must_use]
    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            ..Self::default()
        }
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the exponential multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Uses a custom delay function.
    #[must_use]
    pub fn with_custom<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.strategy = BackoffStrategy::Custom;
        self.custom = Some(Arc::new(f));
        self
    }

    /// Exponential delay for a 1-based attempt: `min(base * multiplier^(n-1), max)`.
    #[must_use]
    pub fn exponential_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.multiplier.max(0.0).powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }

    /// Calculates the delay before the given 1-based retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms.min(self.max_delay_ms),
            BackoffStrategy::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(attempt))
                .min(self.max_delay_ms),
            BackoffStrategy::Exponential => self.exponential_delay_ms(attempt),
            BackoffStrategy::Jittery => {
                let exp = self.exponential_delay_ms(attempt);
                let spread = (exp as f64 * self.jitter_ratio.max(0.0)) as u64;
                if spread == 0 {
                    exp
                } else {
                    exp + rand::thread_rng().gen_range(0..=spread)
                }
            }
            BackoffStrategy::Custom => match &self.custom {
                Some(f) => return f(attempt),
                None => self.exponential_delay_ms(attempt),
            },
        };
        Duration::from_millis(millis)
    }
}
