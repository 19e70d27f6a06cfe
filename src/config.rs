//! Configuration types.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name reported to the engine.
    pub name: String,
    /// Concurrent non-durable runs (also sizes the blocking thread pool).
    pub slots: usize,
    /// Concurrent durable runs.
    pub durable_slots: usize,
    /// Labels reported at registration, used by the engine for affinity.
    pub labels: HashMap<String, String>,
    /// Engine API token.
    pub token: Option<SecretString>,
    /// How long a graceful shutdown waits for in-flight runs.
    pub graceful_shutdown_timeout: Duration,
    pub listener: ListenerConfig,
    pub runner: RunnerConfig,
    pub durable: DurableConfig,
    pub health: HealthConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "relay-worker".to_string(),
            slots: 100,
            durable_slots: 1_000,
            labels: HashMap::new(),
            token: None,
            graceful_shutdown_timeout: Duration::from_secs(30),
            listener: ListenerConfig::default(),
            runner: RunnerConfig::default(),
            durable: DurableConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Action listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Interval between liveness pings.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures before the worker is reported unhealthy.
    pub max_heartbeat_misses: u32,
    /// Fixed backoff between reconnect attempts.
    pub retry_interval: Duration,
    /// Reconnect attempts before the listener gives up.
    pub max_retries: u32,
    /// A gap between connection attempts longer than this resets the retry counter.
    pub retry_reset_after: Duration,
    /// Capacity of each of the two queues between listener and runner.
    pub queue_capacity: usize,
    /// Attempts for submitting a single lifecycle event.
    pub event_send_attempts: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(4),
            max_heartbeat_misses: 3,
            retry_interval: Duration::from_secs(5),
            max_retries: 15,
            retry_reset_after: Duration::from_secs(5),
            queue_capacity: 1_024,
            event_send_attempts: 5,
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// After cancellation, log a warning if the run is still going after this long.
    pub cancellation_warning_threshold: Duration,
    /// After cancellation, escalate if the run is still going after this long.
    pub cancellation_grace_period: Duration,
    /// Release the pool slot of blocking runs that outlive the grace period.
    pub force_terminate_blocking: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cancellation_warning_threshold: Duration::from_millis(300),
            cancellation_grace_period: Duration::from_secs(1),
            force_terminate_blocking: false,
        }
    }
}

/// Durable subsystem configuration.
#[derive(Debug, Clone)]
pub struct DurableConfig {
    /// The durable event stream is rebuilt this often even without errors.
    pub stream_rebuild_interval: Duration,
    /// Backoff before reopening a failed durable event stream.
    pub reconnect_backoff: Duration,
    /// How often the eviction manager sweeps for expired waits.
    pub eviction_sweep_interval: Duration,
    /// Backoff after the engine refuses an eviction.
    pub eviction_retry_backoff: Duration,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            stream_rebuild_interval: Duration::from_secs(30 * 60),
            reconnect_backoff: Duration::from_secs(1),
            eviction_sweep_interval: Duration::from_secs(1),
            eviction_retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Health endpoint configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8001,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from `RELAY_*` environment variables.
    ///
    /// Unparseable values fall back to their defaults with a warning.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let retry_interval = env_millis(
            "RELAY_LISTENER_RETRY_INTERVAL_MS",
            defaults.listener.retry_interval,
        );
        let listener = ListenerConfig {
            heartbeat_interval: env_millis(
                "RELAY_HEARTBEAT_INTERVAL_MS",
                defaults.listener.heartbeat_interval,
            ),
            retry_interval,
            max_retries: env_parse("RELAY_LISTENER_RETRY_COUNT", defaults.listener.max_retries),
            retry_reset_after: env_millis("RELAY_LISTENER_RETRY_RESET_MS", retry_interval),
            ..defaults.listener
        };

        let runner = RunnerConfig {
            cancellation_warning_threshold: env_millis(
                "RELAY_CANCELLATION_WARNING_MS",
                defaults.runner.cancellation_warning_threshold,
            ),
            cancellation_grace_period: env_millis(
                "RELAY_CANCELLATION_GRACE_MS",
                defaults.runner.cancellation_grace_period,
            ),
            force_terminate_blocking: env_parse(
                "RELAY_FORCE_TERMINATE_BLOCKING",
                defaults.runner.force_terminate_blocking,
            ),
        };

        let durable = DurableConfig {
            stream_rebuild_interval: Duration::from_secs(env_parse(
                "RELAY_DURABLE_REBUILD_INTERVAL_SECS",
                defaults.durable.stream_rebuild_interval.as_secs(),
            )),
            ..defaults.durable
        };

        let health = HealthConfig {
            enabled: env_parse("RELAY_HEALTHCHECK_ENABLED", defaults.health.enabled),
            port: env_parse("RELAY_HEALTHCHECK_PORT", defaults.health.port),
        };

        let labels = std::env::var("RELAY_LABELS")
            .map(|raw| parse_labels(&raw))
            .unwrap_or_default();

        let config = Self {
            name: std::env::var("RELAY_WORKER_NAME").unwrap_or(defaults.name),
            slots: env_parse("RELAY_SLOTS", defaults.slots),
            durable_slots: env_parse("RELAY_DURABLE_SLOTS", defaults.durable_slots),
            labels,
            token: std::env::var("RELAY_TOKEN").ok().map(SecretString::from),
            graceful_shutdown_timeout: Duration::from_secs(env_parse(
                "RELAY_GRACEFUL_SHUTDOWN_SECS",
                defaults.graceful_shutdown_timeout.as_secs(),
            )),
            listener,
            runner,
            durable,
            health,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject internally inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == 0 {
            return Err(ConfigError::InvalidValue {
                key: "slots".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.listener.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "listener.queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.runner.cancellation_warning_threshold > self.runner.cancellation_grace_period {
            return Err(ConfigError::InvalidValue {
                key: "runner.cancellation_warning_threshold".to_string(),
                message: format!(
                    "warning threshold {:?} exceeds grace period {:?}",
                    self.runner.cancellation_warning_threshold,
                    self.runner.cancellation_grace_period
                ),
            });
        }
        if self.listener.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "listener.heartbeat_interval".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

/// Parse `k=v,k2=v2` label lists.
fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}
