//! Configuration for the relay.
//!
//! Settings are resolved env-first: `.env` files are loaded via dotenvy, then
//! each option is read from a `RELAY_`-prefixed env var and falls back to its
//! default. Durations are expressed in (possibly fractional) seconds.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration, grouped per component.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub queue: QueueConfig,
    pub bot: BotConfig,
    pub worker: WorkerConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let queue = QueueConfig::resolve()?;
        queue.validate()?;
        let bot = BotConfig::resolve()?;
        let worker = WorkerConfig::resolve(&bot)?;

        Ok(Self {
            broker: BrokerConfig::resolve()?,
            queue,
            bot,
            worker,
            gateway: GatewayConfig::resolve()?,
        })
    }
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis connection URL.
    pub redis_url: String,
}

impl BrokerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: optional_env("RELAY_REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379/0".to_string()),
        })
    }
}

/// Key naming, TTL, and liveness settings shared by every queue user.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name of the FIFO job list.
    pub queue_key: String,
    /// Prefix for per-job status hashes.
    pub status_prefix: String,
    /// Prefix for per-job event channels.
    pub channel_prefix: String,
    /// TTL applied to every job-scoped key on each write.
    pub job_ttl: Duration,
    /// Maximum characters per published `chunk` event.
    pub chunk_char_limit: usize,
    /// Interval between worker heartbeats while a job is in flight.
    pub worker_heartbeat_interval: Duration,
    /// A job whose last heartbeat is older than this is considered stale.
    pub stale_after: Duration,
    /// Period of the watchdog's stale-job sweep.
    pub watchdog_interval: Duration,
    /// How long the blocking path waits for a terminal event.
    pub completion_wait_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_key: "agent:jobs".to_string(),
            status_prefix: "agent:status:".to_string(),
            channel_prefix: "agent:events:".to_string(),
            job_ttl: Duration::from_secs(6 * 60 * 60),
            chunk_char_limit: 600,
            worker_heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(5),
            completion_wait_timeout: Duration::from_secs(210),
        }
    }
}

impl QueueConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            queue_key: optional_env("RELAY_QUEUE_KEY").unwrap_or(defaults.queue_key),
            status_prefix: optional_env("RELAY_STATUS_PREFIX").unwrap_or(defaults.status_prefix),
            channel_prefix: optional_env("RELAY_CHANNEL_PREFIX").unwrap_or(defaults.channel_prefix),
            job_ttl: env_duration("RELAY_JOB_TTL_SECONDS", defaults.job_ttl)?,
            chunk_char_limit: env_parse("RELAY_CHUNK_CHAR_LIMIT", defaults.chunk_char_limit)?,
            worker_heartbeat_interval: env_duration(
                "RELAY_WORKER_HEARTBEAT_SECONDS",
                defaults.worker_heartbeat_interval,
            )?,
            stale_after: env_duration("RELAY_HEARTBEAT_STALE_AFTER_SECONDS", defaults.stale_after)?,
            watchdog_interval: env_duration(
                "RELAY_WATCHDOG_INTERVAL_SECONDS",
                defaults.watchdog_interval,
            )?,
            completion_wait_timeout: env_duration(
                "RELAY_COMPLETION_WAIT_TIMEOUT_SECONDS",
                defaults.completion_wait_timeout,
            )?,
        })
    }

    /// Liveness settings only make sense strictly ordered:
    /// heartbeat interval < staleness threshold < TTL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.worker_heartbeat_interval.is_zero()
            && !self.stale_after.is_zero()
            && self.worker_heartbeat_interval >= self.stale_after
        {
            return Err(ConfigError::Constraint(format!(
                "worker heartbeat interval ({:?}) must be shorter than the staleness threshold ({:?})",
                self.worker_heartbeat_interval, self.stale_after
            )));
        }
        if !self.stale_after.is_zero() && self.stale_after >= self.job_ttl {
            return Err(ConfigError::Constraint(format!(
                "staleness threshold ({:?}) must be shorter than the job TTL ({:?})",
                self.stale_after, self.job_ttl
            )));
        }
        Ok(())
    }
}

/// Bot service endpoint settings.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Base URL of the bot service API.
    pub base_url: String,
    /// Connect timeout for bot service requests.
    pub connect_timeout: Duration,
    /// Advisory timeout for the message-create call. The worker only logs a
    /// warning when it elapses; the call itself is never cancelled. `None`
    /// disables the warning.
    pub request_timeout: Option<Duration>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(180)),
        }
    }
}

impl BotConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let request_timeout = match env_parse::<f64>("RELAY_BOT_REQUEST_TIMEOUT_SECONDS", 180.0)? {
            secs if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
            _ => None,
        };
        Ok(Self {
            base_url: optional_env("RELAY_BOT_BASE_URL").unwrap_or(defaults.base_url),
            connect_timeout: env_duration(
                "RELAY_BOT_CONNECT_TIMEOUT_SECONDS",
                defaults.connect_timeout,
            )?,
            request_timeout,
        })
    }
}

/// Worker runtime settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of parallel consumer loops in one worker process.
    pub concurrency: usize,
    /// How long a single blocking pop waits before re-polling (this bounds
    /// how quickly an idle worker notices a shutdown signal).
    pub pop_timeout: Duration,
    /// Advisory backend-call timeout, copied from [`BotConfig`].
    pub soft_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            pop_timeout: Duration::from_secs(5),
            soft_timeout: Some(Duration::from_secs(180)),
        }
    }
}

impl WorkerConfig {
    fn resolve(bot: &BotConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            concurrency: env_parse("RELAY_WORKER_CONCURRENCY", defaults.concurrency)?,
            pop_timeout: defaults.pop_timeout,
            soft_timeout: bot.request_timeout,
        })
    }
}

/// Gateway listener settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// User id attached to requests that carry none.
    pub default_user_id: String,
    /// Role forwarded on every bot service call. `None` drops the
    /// `X-User-Role` header entirely.
    pub default_user_role: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8080).into(),
            default_user_id: "openai-proxy".to_string(),
            default_user_role: Some("default".to_string()),
        }
    }
}

impl GatewayConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            listen_addr: env_parse("RELAY_GATEWAY_ADDR", defaults.listen_addr)?,
            default_user_id: optional_env("RELAY_DEFAULT_USER_ID")
                .unwrap_or(defaults.default_user_id),
            default_user_role: optional_env("RELAY_DEFAULT_USER_ROLE")
                .or(defaults.default_user_role),
        })
    }
}

/// Read an env var, treating empty values as unset.
fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            reason: format!("{e}"),
        }),
        None => Ok(default),
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_secs = default.as_secs_f64();
    let secs = env_parse::<f64>(key, default_secs)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: secs.to_string(),
            reason: "must be a non-negative number of seconds".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}
