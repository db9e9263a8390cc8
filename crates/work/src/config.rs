//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Prefix of every environment variable read by [`WorkConfig::from_env`].
pub const ENV_PREFIX: &str = "FLOWFORGE_WORK_";

/// Configuration error. Raised when the engine is built, never at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("error type name must not be blank")]
    BlankErrorTypeName,

    #[error("unknown error type `{0}`")]
    UnknownErrorType(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot parse environment variable {var}={value:?}")]
    InvalidEnv { var: String, value: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Work engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    /// Worker threads per tenant pool
    pub thread_count: usize,
    /// Bound on the ready queue of each pool
    pub queue_capacity: usize,
    /// How often deferred works are checked against the clock
    pub poll_interval_ms: u64,
    /// Retry ceiling
    pub max_retries: u32,
    /// Backoff base delay
    pub base_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_factor: f64,
    /// Error type names treated as retryable
    pub retryable_errors: Vec<String>,
    /// Error type names never retried (wins over `retryable_errors`)
    pub never_retry_errors: Vec<String>,
    /// How long pause/stop wait for in-flight works
    pub await_termination_timeout_ms: u64,
    /// Extra delay when a commit involved several resources
    pub delay_on_multiple_resources_ms: u64,
    /// Fail `execute` while stopped instead of ignoring the work
    pub reject_when_stopped: bool,
    /// Wrap pools with the retry decorator
    pub retry_enabled: bool,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            thread_count: 4,
            queue_capacity: 10_000,
            poll_interval_ms: 50,
            max_retries: 10,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            retryable_errors: Vec::new(),
            never_retry_errors: Vec::new(),
            await_termination_timeout_ms: 30_000,
            delay_on_multiple_resources_ms: 0,
            reject_when_stopped: false,
            retry_enabled: true,
        }
    }
}

/// Durations are kept in whole milliseconds, rounded up so that a non-zero
/// duration never turns into zero.
fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

impl WorkConfig {
    pub fn with_thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = whole_millis(interval);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration, factor: f64) -> Self {
        self.max_retries = max_retries;
        self.base_delay_ms = whole_millis(base_delay);
        self.backoff_factor = factor;
        self
    }

    pub fn with_retryable_errors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_never_retry_errors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.never_retry_errors = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_await_termination_timeout(mut self, timeout: Duration) -> Self {
        self.await_termination_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_delay_on_multiple_resources(mut self, delay: Duration) -> Self {
        self.delay_on_multiple_resources_ms = whole_millis(delay);
        self
    }

    pub fn with_reject_when_stopped(mut self, reject: bool) -> Self {
        self.reject_when_stopped = reject;
        self
    }

    pub fn with_retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn await_termination_timeout(&self) -> Duration {
        Duration::from_millis(self.await_termination_timeout_ms)
    }

    pub fn delay_on_multiple_resources(&self) -> Duration {
        Duration::from_millis(self.delay_on_multiple_resources_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::invalid("thread_count", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be at least 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_factor",
                format!("must be a finite number >= 1.0, got {}", self.backoff_factor),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `FLOWFORGE_WORK_*` environment variables.
    ///
    /// List settings are comma-separated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |name: &str| {
            let var = format!("{ENV_PREFIX}{name}");
            lookup(&var).map(|value| (var, value))
        };

        if let Some(v) = read("THREAD_COUNT") {
            config.thread_count = parse(v)?;
        }
        if let Some(v) = read("QUEUE_CAPACITY") {
            config.queue_capacity = parse(v)?;
        }
        if let Some(v) = read("POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse(v)?;
        }
        if let Some(v) = read("MAX_RETRIES") {
            config.max_retries = parse(v)?;
        }
        if let Some(v) = read("BASE_DELAY_MS") {
            config.base_delay_ms = parse(v)?;
        }
        if let Some(v) = read("BACKOFF_FACTOR") {
            config.backoff_factor = parse(v)?;
        }
        if let Some((_, v)) = read("RETRYABLE_ERRORS") {
            config.retryable_errors = split_list(&v);
        }
        if let Some((_, v)) = read("NEVER_RETRY_ERRORS") {
            config.never_retry_errors = split_list(&v);
        }
        if let Some(v) = read("AWAIT_TERMINATION_TIMEOUT_MS") {
            config.await_termination_timeout_ms = parse(v)?;
        }
        if let Some(v) = read("DELAY_ON_MULTIPLE_RESOURCES_MS") {
            config.delay_on_multiple_resources_ms = parse(v)?;
        }
        if let Some(v) = read("REJECT_WHEN_STOPPED") {
            config.reject_when_stopped = parse(v)?;
        }
        if let Some(v) = read("RETRY_ENABLED") {
            config.retry_enabled = parse(v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>((var, value): (String, String)) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
