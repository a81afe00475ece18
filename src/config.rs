use std::env;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub smtp: SmtpConfig,
    pub sms: SmsConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Single origin allowed by CORS. When unset every origin is allowed.
    pub cors_allowed_origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Transport location: `sqlite://<path>` for the durable queue or `memory://`.
    pub url: String,
    /// Name of the main lane; the retry and dead lanes are derived from it.
    pub name: String,
    /// Number of redeliveries after the first failed attempt.
    pub max_retries: u32,
    /// How long an envelope waits in the retry lane before it is visible again.
    pub retry_delay_ms: u64,
    /// How often the consumer checks the main lane when it was found empty.
    pub poll_interval_ms: u64,
    /// Maximum number of envelopes handled concurrently by the consumer.
    pub worker_concurrency: u32,
    pub max_connections: u32,
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second replenished for each client IP on the notification endpoints
    pub per_second: u32,
    /// Requests a client IP may make at once before it is throttled
    pub burst: u32,
}

impl RateLimitConfig {
    /// Time between two replenished requests for one client.
    pub fn replenish_interval(&self) -> Duration {
        Duration::from_secs(1) / self.per_second.max(1)
    }
}

/// Read `name` and parse it, falling back to `default` when the variable is unset.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: parse_env("PORT", defaults.server.port)?,
                cors_allowed_origin: optional_env("CORS_ALLOWED_ORIGIN"),
            },
            queue: QueueConfig {
                url: optional_env("QUEUE_URL").unwrap_or(defaults.queue.url),
                name: optional_env("QUEUE_NAME").unwrap_or(defaults.queue.name),
                max_retries: parse_env("QUEUE_MAX_RETRIES", defaults.queue.max_retries)?,
                retry_delay_ms: parse_env("QUEUE_RETRY_DELAY_MS", defaults.queue.retry_delay_ms)?,
                poll_interval_ms: parse_env(
                    "QUEUE_POLL_INTERVAL_MS",
                    defaults.queue.poll_interval_ms,
                )?,
                worker_concurrency: parse_env(
                    "QUEUE_WORKER_CONCURRENCY",
                    defaults.queue.worker_concurrency,
                )?,
                max_connections: parse_env(
                    "QUEUE_MAX_CONNECTIONS",
                    defaults.queue.max_connections,
                )?,
            },
            smtp: SmtpConfig {
                host: optional_env("SMTP_HOST"),
                port: parse_env("SMTP_PORT", defaults.smtp.port)?,
                user: optional_env("SMTP_USER"),
                password: optional_env("SMTP_PASS"),
                from: optional_env("SMTP_FROM"),
            },
            sms: SmsConfig {
                account_sid: optional_env("TWILIO_ACCOUNT_SID"),
                auth_token: optional_env("TWILIO_AUTH_TOKEN"),
                from_number: optional_env("TWILIO_PHONE_NUMBER"),
                api_base_url: optional_env("TWILIO_API_BASE_URL")
                    .unwrap_or(defaults.sms.api_base_url),
            },
            rate_limit: RateLimitConfig {
                per_second: parse_env("RATE_LIMIT_PER_SECOND", defaults.rate_limit.per_second)?,
                burst: parse_env("RATE_LIMIT_BURST", defaults.rate_limit.burst)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("QUEUE_WORKER_CONCURRENCY", self.queue.worker_concurrency),
            ("RATE_LIMIT_PER_SECOND", self.rate_limit.per_second),
            ("RATE_LIMIT_BURST", self.rate_limit.burst),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero {
            Some((name, _)) => Err(ConfigError::InvalidValue(name.to_string())),
            None => Ok(()),
        }
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
                port: 3000,
                cors_allowed_origin: None,
            },
            queue: QueueConfig {
                url: "sqlite://data/queue.db".to_string(),
                name: "notifications".to_string(),
                max_retries: 3,
                retry_delay_ms: 60_000,
                poll_interval_ms: 250,
                worker_concurrency: 10,
                max_connections: 5,
            },
            smtp: SmtpConfig {
                host: None,
                port: 587,
                user: None,
                password: None,
                from: None,
            },
            sms: SmsConfig {
                account_sid: None,
                auth_token: None,
                from_number: None,
                api_base_url: "https://api.twilio.com".to_string(),
            },
            rate_limit: RateLimitConfig {
                per_second: 10,
                burst: 50,
            },
        }
    }
}
