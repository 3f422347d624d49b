use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub worker_pool: WorkerPoolConfig,
    pub queue: QueueConfig,
    pub stuck: StuckConfig,
    pub notifications: NotificationsConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS for browser clients of the event streams.
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolConfig {
    /// Clamp for the current worker count.
    pub min: usize,
    pub max: usize,

    /// Utilization (active / current) at or above which the pool grows.
    pub scale_up_threshold: f64,
    /// Utilization at or below which the pool may retire an idle worker.
    pub scale_down_threshold: f64,

    /// Seconds between scaling decisions.
    pub scale_interval_seconds: u64,
    /// A worker idle at least this long is eligible for retirement.
    pub idle_timeout_seconds: u64,

    /// Host admission caps, percent of total.
    pub cpu_ceiling_percent: f64,
    pub mem_ceiling_percent: f64,

    /// Seconds between the termination signal and a hard kill during
    /// cancellation and shutdown.
    pub grace_termination_seconds: u64,

    /// Seconds between heartbeats emitted for a running task.
    pub heartbeat_interval_seconds: u64,

    /// Seconds between resource samples for attached processes.
    pub sample_interval_seconds: u64,
    /// Seconds between persisted snapshots; >= sample interval, samples
    /// in between are held in memory only.
    pub persist_interval_seconds: u64,
    /// Per-task cap on retained snapshot rows.
    pub snapshot_keep: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Worker idle re-poll delay in seconds.
    pub poll_interval_seconds: u64,
    /// Claim lease length in seconds.
    pub visibility_timeout_seconds: u64,
    /// Default retries before dead-letter when the task config omits it.
    pub max_retries: u32,
    /// Exponential backoff base in seconds for retry scheduling.
    pub retry_backoff_base_seconds: u64,
    /// Cap for the backoff curve in seconds.
    pub retry_backoff_cap_seconds: u64,
    /// Jitter fraction (0..1) applied to each backoff delay.
    pub jitter: f64,
    /// Seconds between reaper passes over expired leases.
    pub reap_interval_seconds: u64,
    /// Bounded attempts for store writes before surfacing
    /// StoreUnavailable.
    pub store_retry_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StuckConfig {
    /// Seconds without a heartbeat after which a running task is stuck.
    pub heartbeat_timeout_seconds: u64,
    /// Seconds between detector passes.
    pub check_interval_seconds: u64,
    /// cpu_percent below this across the window counts as frozen.
    pub cpu_floor_percent: f64,
    /// Bytes-per-snapshot growth slope above which memory is runaway.
    pub mem_slope_bytes: i64,
    /// Number of trailing snapshots examined per signal.
    pub io_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    /// Per-connection outbound queue capacity for push streams.
    pub push_buffer_size: usize,
    /// Seconds between application-level heartbeats on push streams.
    pub push_heartbeat_interval_seconds: u64,
    /// Default delivery attempts per webhook when the subscription omits
    /// its own limit.
    pub webhook_max_retries: i64,
    /// Per-call timeout in seconds for webhook POSTs.
    pub webhook_timeout_seconds: u64,
    /// Base in seconds for the webhook retry backoff curve.
    pub webhook_backoff_base_seconds: u64,
    /// Cap in seconds for the webhook retry backoff curve.
    pub webhook_backoff_cap_seconds: u64,
    /// Jitter fraction (0..1) applied to webhook retry delays.
    pub webhook_jitter: f64,
    /// Catch-up ring buffer bound (events).
    pub polling_ring_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for task submission endpoints
    pub api_per_second: u32,
    /// Burst size for task submission endpoints
    pub api_burst: u32,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let sample_interval = env_parse("MONITOR_SAMPLE_INTERVAL_SECONDS", 2u64);
        let persist_interval = env_parse("MONITOR_PERSIST_INTERVAL_SECONDS", 10u64);
        if persist_interval < sample_interval {
            return Err(ConfigError::InvalidValue(
                "MONITOR_PERSIST_INTERVAL_SECONDS must be >= MONITOR_SAMPLE_INTERVAL_SECONDS"
                    .to_string(),
            ));
        }

        let pool_min = env_parse("WORKER_POOL_MIN", 1usize);
        let pool_max = env_parse("WORKER_POOL_MAX", 8usize);
        if pool_min == 0 || pool_max < pool_min {
            return Err(ConfigError::InvalidValue(
                "WORKER_POOL_MIN/WORKER_POOL_MAX".to_string(),
            ));
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/taskforge.db".to_string()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5u32),
            },
            worker_pool: WorkerPoolConfig {
                min: pool_min,
                max: pool_max,
                scale_up_threshold: env_parse("WORKER_POOL_SCALE_UP_THRESHOLD", 0.8f64),
                scale_down_threshold: env_parse("WORKER_POOL_SCALE_DOWN_THRESHOLD", 0.3f64),
                scale_interval_seconds: env_parse("WORKER_POOL_SCALE_INTERVAL_SECONDS", 15u64),
                idle_timeout_seconds: env_parse("WORKER_POOL_IDLE_TIMEOUT_SECONDS", 60u64),
                cpu_ceiling_percent: env_parse("WORKER_POOL_CPU_CEILING_PERCENT", 85.0f64),
                mem_ceiling_percent: env_parse("WORKER_POOL_MEM_CEILING_PERCENT", 85.0f64),
                grace_termination_seconds: env_parse("WORKER_POOL_GRACE_TERMINATION_SECONDS", 10u64),
                heartbeat_interval_seconds: env_parse("WORKER_HEARTBEAT_INTERVAL_SECONDS", 5u64),
                sample_interval_seconds: sample_interval,
                persist_interval_seconds: persist_interval,
                snapshot_keep: env_parse("MONITOR_SNAPSHOT_KEEP", 500i64),
            },
            queue: QueueConfig {
                poll_interval_seconds: env_parse("QUEUE_POLL_INTERVAL_SECONDS", 2u64),
                visibility_timeout_seconds: env_parse("QUEUE_VISIBILITY_TIMEOUT_SECONDS", 60u64),
                max_retries: env_parse("QUEUE_MAX_RETRIES", 3u32),
                retry_backoff_base_seconds: env_parse("QUEUE_RETRY_BACKOFF_BASE_SECONDS", 30u64),
                retry_backoff_cap_seconds: env_parse("QUEUE_RETRY_BACKOFF_CAP_SECONDS", 3600u64),
                jitter: env_parse("QUEUE_RETRY_JITTER", 0.1f64),
                reap_interval_seconds: env_parse("QUEUE_REAP_INTERVAL_SECONDS", 10u64),
                store_retry_attempts: env_parse("QUEUE_STORE_RETRY_ATTEMPTS", 3u32),
            },
            stuck: StuckConfig {
                heartbeat_timeout_seconds: env_parse("STUCK_HEARTBEAT_TIMEOUT_SECONDS", 30u64),
                check_interval_seconds: env_parse("STUCK_CHECK_INTERVAL_SECONDS", 10u64),
                cpu_floor_percent: env_parse("STUCK_CPU_FLOOR_PERCENT", 0.5f64),
                mem_slope_bytes: env_parse("STUCK_MEM_SLOPE_BYTES", 50_000_000i64),
                io_window: env_parse("STUCK_IO_WINDOW", 5usize),
            },
            notifications: NotificationsConfig {
                push_buffer_size: env_parse("PUSH_BUFFER_SIZE", 256usize),
                push_heartbeat_interval_seconds: env_parse(
                    "PUSH_HEARTBEAT_INTERVAL_SECONDS",
                    15u64,
                ),
                webhook_max_retries: env_parse("WEBHOOK_MAX_RETRIES", 5i64),
                webhook_timeout_seconds: env_parse("WEBHOOK_TIMEOUT_SECONDS", 10u64),
                webhook_backoff_base_seconds: env_parse("WEBHOOK_BACKOFF_BASE_SECONDS", 2u64),
                webhook_backoff_cap_seconds: env_parse("WEBHOOK_BACKOFF_CAP_SECONDS", 300u64),
                webhook_jitter: env_parse("WEBHOOK_RETRY_JITTER", 0.1f64),
                polling_ring_size: env_parse("POLLING_RING_SIZE", 4096usize),
            },
            rate_limit: RateLimitConfig {
                api_per_second: env_parse("RATE_LIMIT_API_PER_SECOND", 20u32),
                api_burst: env_parse("RATE_LIMIT_API_BURST", 50u32),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/taskforge.db".to_string(),
                max_connections: 5,
            },
            worker_pool: WorkerPoolConfig {
                min: 1,
                max: 8,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.3,
                scale_interval_seconds: 15,
                idle_timeout_seconds: 60,
                cpu_ceiling_percent: 85.0,
                mem_ceiling_percent: 85.0,
                grace_termination_seconds: 10,
                heartbeat_interval_seconds: 5,
                sample_interval_seconds: 2,
                persist_interval_seconds: 10,
                snapshot_keep: 500,
            },
            queue: QueueConfig {
                poll_interval_seconds: 2,
                visibility_timeout_seconds: 60,
                max_retries: 3,
                retry_backoff_base_seconds: 30,
                retry_backoff_cap_seconds: 3600,
                jitter: 0.1,
                reap_interval_seconds: 10,
                store_retry_attempts: 3,
            },
            stuck: StuckConfig {
                heartbeat_timeout_seconds: 30,
                check_interval_seconds: 10,
                cpu_floor_percent: 0.5,
                mem_slope_bytes: 50_000_000,
                io_window: 5,
            },
            notifications: NotificationsConfig {
                push_buffer_size: 256,
                push_heartbeat_interval_seconds: 15,
                webhook_max_retries: 5,
                webhook_timeout_seconds: 10,
                webhook_backoff_base_seconds: 2,
                webhook_backoff_cap_seconds: 300,
                webhook_jitter: 0.1,
                polling_ring_size: 4096,
            },
            rate_limit: RateLimitConfig {
                api_per_second: 20,
                api_burst: 50,
            },
        }
    }
}
