//! Server configuration.
//!
//! Every field has a default, so an empty (or missing) file is a valid configuration.
//! `LONGSHOT_*` environment variables override the file; invalid values are logged and
//! ignored.

use std::fs;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use longshot_limit::FailurePolicy;
use longshot_poll::MutatorConfig;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub long_poll: LongPollConfig,
    pub token_bucket: TokenBucketConfig,
    pub fixed_window: WindowConfig,
    pub sliding_window: WindowConfig,
    pub distributed: DistributedConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Forget rate limit state for clients idle this long. `0` disables eviction.
    pub idle_eviction_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            idle_eviction_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LongPollConfig {
    /// How long `/status` holds a request open.
    pub timeout_ms: u64,
    /// Events `EVENT#00` up to `EVENT#{events - 1}` are seeded at start.
    pub events: usize,
    pub initial_score: i64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Each tick adds between 1 and this many points to a random event.
    pub max_score_step: i64,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            events: 3,
            initial_score: 0,
            min_interval_ms: 2_000,
            max_interval_ms: 5_000,
            max_score_step: 3,
        }
    }
}

impl LongPollConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn event_ids(&self) -> Vec<String> {
        (0..self.events).map(|i| format!("EVENT#{i:02}")).collect()
    }

    pub fn mutator(&self) -> MutatorConfig {
        MutatorConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenBucketConfig {
    pub capacity: usize,
    /// Tokens added every `interval_ms`.
    pub refill: usize,
    pub interval_ms: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill: 1,
            interval_ms: 1_000,
        }
    }
}

/// Shared by the fixed and sliding window limiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub max_requests: usize,
    pub window_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window_ms: 10_000,
        }
    }
}

impl WindowConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    Open,
    #[default]
    Closed,
}

impl From<FailureMode> for FailurePolicy {
    fn from(mode: FailureMode) -> Self {
        match mode {
            FailureMode::Open => FailurePolicy::Open,
            FailureMode::Closed => FailurePolicy::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributedConfig {
    pub max_requests: usize,
    pub window_ms: u64,
    /// What to do when the store is unreachable.
    pub on_store_failure: FailureMode,
    pub key_prefix: String,
    /// Only used with the `redis` feature. Without it the store is in-process.
    pub redis_url: Option<String>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window_ms: 10_000,
            on_store_failure: FailureMode::default(),
            key_prefix: "ratelimit".to_string(),
            redis_url: None,
        }
    }
}

impl DistributedConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Config {
    /// Load `path` (defaults if `None`), apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, or the result is
    /// invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `LONGSHOT_*` overrides, looking each variable up through `var`.
    pub fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            var(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(raw) = lookup("LONGSHOT_ADDR") {
            match raw.parse() {
                Ok(addr) => self.server.addr = addr,
                Err(err) => tracing::warn!("invalid LONGSHOT_ADDR, ignoring: {err}"),
            }
        }

        if let Some(raw) = lookup("LONGSHOT_POLL_TIMEOUT_MS") {
            match raw.parse() {
                Ok(ms) => self.long_poll.timeout_ms = ms,
                Err(err) => tracing::warn!("invalid LONGSHOT_POLL_TIMEOUT_MS, ignoring: {err}"),
            }
        }

        if let Some(raw) = lookup("LONGSHOT_STORE_FAILURE") {
            match raw.as_str() {
                "open" => self.distributed.on_store_failure = FailureMode::Open,
                "closed" => self.distributed.on_store_failure = FailureMode::Closed,
                other => tracing::warn!("invalid LONGSHOT_STORE_FAILURE {other:?}, ignoring"),
            }
        }

        if let Some(url) = lookup("LONGSHOT_REDIS_URL") {
            self.distributed.redis_url = Some(url);
        }
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.long_poll.timeout_ms == 0 {
            return invalid("long_poll.timeout_ms must be positive");
        }
        if self.long_poll.min_interval_ms > self.long_poll.max_interval_ms {
            return invalid("long_poll.min_interval_ms must not exceed max_interval_ms");
        }
        if self.long_poll.max_score_step < 1 {
            return invalid("long_poll.max_score_step must be at least 1");
        }
        if self.token_bucket.capacity == 0 || self.token_bucket.refill == 0 {
            return invalid("token_bucket.capacity and refill must be positive");
        }
        if self.token_bucket.interval_ms == 0 {
            return invalid("token_bucket.interval_ms must be positive");
        }
        for (name, window) in [
            ("fixed_window", &self.fixed_window),
            ("sliding_window", &self.sliding_window),
        ] {
            if window.max_requests == 0 || window.window_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.max_requests and window_ms must be positive"
                )));
            }
        }
        if self.distributed.max_requests == 0 || self.distributed.window_ms == 0 {
            return invalid("distributed.max_requests and window_ms must be positive");
        }
        Ok(())
    }
}

/// `value` as a [`NonZeroUsize`], for fields already checked by [`Config::validate`].
pub(crate) fn non_zero(value: usize, field: &str) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value)
        .ok_or_else(|| ConfigError::Invalid(format!("{field} must be positive")))
}
