use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Tunables for the live ack wait and the two background queues
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long a live `message:new` push waits for `message:ack:delivered`
    pub ack_timeout: Duration,
    /// Delay before the first offline delivery attempt
    pub initial_delay: Duration,
    /// Backoff before the second attempt; doubles per attempt after that
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Total attempts (including the first) before dead-lettering
    pub max_attempts: u32,
    pub jitter: bool,
    pub poll_interval: Duration,
    pub worker_concurrency: usize,
    /// Reserved jobs whose lease expires are handed out again
    pub lease: Duration,
    pub key_prefix: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            initial_delay: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            max_attempts: 5,
            jitter: false,
            poll_interval: Duration::from_millis(500),
            worker_concurrency: 16,
            lease: Duration::from_secs(60),
            key_prefix: "skills:msg".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: usize,
    pub redis_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub push_gateway_url: Option<String>,
    pub enrollment_service_url: Option<String>,
    pub delivery: DeliveryConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let database_url =
            env::var("DATABASE_URL").map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;
        if jwt_secret.len() < 16 {
            return Err(AppError::Config(
                "JWT_SECRET must be at least 16 bytes".into(),
            ));
        }
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            ack_timeout: env_millis("ACK_TIMEOUT_MS", defaults.ack_timeout),
            initial_delay: env_millis("QUEUE_INITIAL_DELAY_MS", defaults.initial_delay),
            backoff_base: env_millis("QUEUE_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_max: env_millis("QUEUE_BACKOFF_MAX_MS", defaults.backoff_max),
            max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            jitter: env::var("QUEUE_BACKOFF_JITTER")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(defaults.jitter),
            poll_interval: env_millis("QUEUE_POLL_INTERVAL_MS", defaults.poll_interval),
            worker_concurrency: env_parse("QUEUE_WORKER_CONCURRENCY", defaults.worker_concurrency)
                .max(1),
            lease: env_millis("QUEUE_LEASE_MS", defaults.lease),
            key_prefix: env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
        };

        Ok(Self {
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", 16),
            redis_url,
            port: env_parse("PORT", 3000),
            jwt_secret,
            push_gateway_url: env_opt("PUSH_GATEWAY_URL"),
            enrollment_service_url: env_opt("ENROLLMENT_SERVICE_URL"),
            delivery,
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/skills_test".to_string(),
            db_max_connections: 4,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            port: 0,
            jwt_secret: "test-secret-at-least-16-bytes".to_string(),
            push_gateway_url: None,
            enrollment_service_url: None,
            delivery: DeliveryConfig::default(),
        }
    }
}
