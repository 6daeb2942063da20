//! Process configuration loaded once at startup from the environment.
//!
//! There is no global mutable config: [`Config::from_env`] is called once
//! in `main`, wrapped in an `Arc`, and passed down to whatever needs it.
//! Every environment variable this process reads is a field here with
//! the documented default.

pub mod error;

use std::time::Duration;

pub use error::ConfigError;
use error::Result;

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker_url: String,
    pub durable_store_url: String,
    pub durable_store_service_key: String,
    pub token_verifier_url: String,

    pub pricing_cache_ttl: Duration,

    pub sandbox_pool: SandboxPoolConfig,
    pub breaker: CircuitBreakerConfig,
    pub rate_limits: RateLimitConfig,
    pub queue: QueueConfig,
    pub ot: OtConfig,
    pub billing: BillingConfig,
}

#[derive(Debug, Clone)]
pub struct SandboxPoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub max_sandbox_age: Duration,
    pub max_idle_seconds: Duration,
    pub warmup_interval: Duration,
    pub cleanup_interval: Duration,
    pub expiry_interval: Duration,
}

impl Default for SandboxPoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 3,
            max_pool_size: 10,
            max_sandbox_age: Duration::from_secs(3600),
            max_idle_seconds: Duration::from_secs(300),
            warmup_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            expiry_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub activation_threshold: f64,
    pub deactivation_threshold: f64,
    pub open_duration: Duration,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.95,
            deactivation_threshold: 0.85,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub operation_per_minute: u32,
    pub cursor_per_minute: u32,
    pub general_per_minute: u32,
    pub billing_requests_per_minute: u32,
    pub degradation_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            operation_per_minute: 300,
            cursor_per_minute: 1200,
            general_per_minute: 600,
            billing_requests_per_minute: 120,
            degradation_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub transient_error_keywords: Vec<String>,
    pub reconciler_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(900),
            transient_error_keywords: [
                "timeout",
                "connection",
                "unavailable",
                "rate limit",
                "temporarily",
                "502",
                "503",
                "504",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            reconciler_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OtConfig {
    pub checkpoint_interval: u64,
}

impl Default for OtConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub failure_threshold: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
        }
    }
}

impl Config {
    /// Loads configuration from the environment, falling back to the
    /// defaults above for anything unset. Only the three URLs without a
    /// sensible default are required.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            broker_url: require_var("CP_BROKER_URL")?,
            durable_store_url: require_var("CP_STORE_URL")?,
            durable_store_service_key: require_var("CP_STORE_SERVICE_KEY")?,
            token_verifier_url: require_var("CP_TOKEN_VERIFIER_URL")?,
            pricing_cache_ttl: duration_secs_var("CP_PRICING_CACHE_TTL_SECS", 3600)?,
            sandbox_pool: SandboxPoolConfig {
                min_pool_size: usize_var("CP_SANDBOX_MIN_POOL_SIZE", 3)?,
                max_pool_size: usize_var("CP_SANDBOX_MAX_POOL_SIZE", 10)?,
                max_sandbox_age: duration_secs_var("CP_SANDBOX_MAX_AGE_SECS", 3600)?,
                max_idle_seconds: duration_secs_var("CP_SANDBOX_MAX_IDLE_SECS", 300)?,
                warmup_interval: duration_secs_var("CP_SANDBOX_WARMUP_INTERVAL_SECS", 30)?,
                ..SandboxPoolConfig::default()
            },
            breaker: CircuitBreakerConfig {
                activation_threshold: f64_var("CP_BREAKER_ACTIVATION_THRESHOLD", 0.95)?,
                deactivation_threshold: f64_var("CP_BREAKER_DEACTIVATION_THRESHOLD", 0.85)?,
                open_duration: duration_secs_var("CP_BREAKER_OPEN_DURATION_SECS", 30)?,
                half_open_max_requests: u32_var("CP_BREAKER_HALF_OPEN_MAX_REQUESTS", 10)?,
            },
            rate_limits: RateLimitConfig::default(),
            queue: QueueConfig {
                max_retries: u32_var("CP_QUEUE_MAX_RETRIES", 3)?,
                ..QueueConfig::default()
            },
            ot: OtConfig::default(),
            billing: BillingConfig::default(),
        })
    }
}

fn require_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
            name: name.to_string(),
            value: raw,
            reason: "failed to parse".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn duration_secs_var(name: &str, default_secs: u64) -> Result<Duration> {
    parsed_var(name, default_secs).map(Duration::from_secs)
}

fn usize_var(name: &str, default: usize) -> Result<usize> {
    parsed_var(name, default)
}

fn u32_var(name: &str, default: u32) -> Result<u32> {
    parsed_var(name, default)
}

fn f64_var(name: &str, default: f64) -> Result<f64> {
    parsed_var(name, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let pool = SandboxPoolConfig::default();
        assert_eq!(pool.min_pool_size, 3);
        assert_eq!(pool.max_pool_size, 10);
        assert_eq!(pool.max_sandbox_age, Duration::from_secs(3600));

        let breaker = CircuitBreakerConfig::default();
        assert_eq!(breaker.activation_threshold, 0.95);
        assert_eq!(breaker.deactivation_threshold, 0.85);
    }

    #[test]
    fn transient_keywords_match_closed_set() {
        let queue = QueueConfig::default();
        assert!(queue.transient_error_keywords.contains(&"502".to_string()));
        assert_eq!(queue.transient_error_keywords.len(), 8);
    }
}
