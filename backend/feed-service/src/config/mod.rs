use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub fanout: FanoutConfig,
    pub feed: FeedConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Write-path tuning for the fan-out workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Authors at or above this follower count are pull-only
    pub celebrity_threshold: i64,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub claim_batch_size: usize,
    pub job_concurrency: usize,
    pub max_retries: i32,
    /// Job retry `n` waits `n² × retry_unit`
    pub retry_unit: Duration,
    pub follower_page_size: usize,
    pub write_batch_size: usize,
    pub batch_max_retries: u32,
    /// Sub-batch retry `n` waits `n × batch_retry_step`
    pub batch_retry_step: Duration,
    pub lease_duration: Duration,
    pub store_timeout: Duration,
    pub cleanup_interval: Duration,
    pub completed_retention: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            celebrity_threshold: 100_000,
            worker_count: 2,
            poll_interval: Duration::from_millis(500),
            claim_batch_size: 10,
            job_concurrency: 4,
            max_retries: 3,
            retry_unit: Duration::from_secs(1),
            follower_page_size: 1000,
            write_batch_size: 500,
            batch_max_retries: 3,
            batch_retry_step: Duration::from_secs(1),
            lease_duration: Duration::from_secs(300),
            store_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),
            completed_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Read-path tuning for `GetUserFeed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub following_cap: usize,
    /// Celebrity posts older than this are not pulled
    pub pull_window: Duration,
    pub max_pull_concurrency: usize,
    pub store_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            following_cap: 1000,
            pull_window: Duration::from_secs(24 * 3600),
            max_pull_concurrency: 8,
            store_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let fanout_defaults = FanoutConfig::default();
        let feed_defaults = FeedConfig::default();
        let cache_defaults = CacheConfig::default();

        Ok(Config {
            app: AppConfig {
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                port: env_parse("APP_PORT", 8000)?,
                log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            fanout: FanoutConfig {
                celebrity_threshold: env_parse(
                    "CELEBRITY_THRESHOLD",
                    fanout_defaults.celebrity_threshold,
                )?,
                worker_count: env_parse("FANOUT_WORKER_COUNT", fanout_defaults.worker_count)?,
                poll_interval: env_millis("FANOUT_POLL_INTERVAL_MS", fanout_defaults.poll_interval)?,
                claim_batch_size: env_parse(
                    "FANOUT_CLAIM_BATCH_SIZE",
                    fanout_defaults.claim_batch_size,
                )?,
                job_concurrency: env_parse(
                    "FANOUT_JOB_CONCURRENCY",
                    fanout_defaults.job_concurrency,
                )?,
                max_retries: env_parse("FANOUT_MAX_RETRIES", fanout_defaults.max_retries)?,
                retry_unit: env_millis("FANOUT_RETRY_UNIT_MS", fanout_defaults.retry_unit)?,
                follower_page_size: env_parse(
                    "FANOUT_FOLLOWER_PAGE_SIZE",
                    fanout_defaults.follower_page_size,
                )?,
                write_batch_size: env_parse(
                    "FANOUT_WRITE_BATCH_SIZE",
                    fanout_defaults.write_batch_size,
                )?,
                batch_max_retries: env_parse(
                    "FANOUT_BATCH_MAX_RETRIES",
                    fanout_defaults.batch_max_retries,
                )?,
                batch_retry_step: env_millis(
                    "FANOUT_BATCH_RETRY_STEP_MS",
                    fanout_defaults.batch_retry_step,
                )?,
                lease_duration: env_secs("FANOUT_LEASE_SECS", fanout_defaults.lease_duration)?,
                store_timeout: env_millis(
                    "FANOUT_STORE_TIMEOUT_MS",
                    fanout_defaults.store_timeout,
                )?,
                cleanup_interval: env_secs(
                    "FANOUT_CLEANUP_INTERVAL_SECS",
                    fanout_defaults.cleanup_interval,
                )?,
                completed_retention: Duration::from_secs(
                    env_parse(
                        "FANOUT_COMPLETED_RETENTION_HOURS",
                        fanout_defaults.completed_retention.as_secs() / 3600,
                    )? * 3600,
                ),
            },
            feed: FeedConfig {
                default_limit: env_parse("FEED_DEFAULT_LIMIT", feed_defaults.default_limit)?,
                max_limit: env_parse("FEED_MAX_LIMIT", feed_defaults.max_limit)?,
                following_cap: env_parse("FEED_FOLLOWING_CAP", feed_defaults.following_cap)?,
                pull_window: Duration::from_secs(
                    env_parse(
                        "FEED_PULL_WINDOW_HOURS",
                        feed_defaults.pull_window.as_secs() / 3600,
                    )? * 3600,
                ),
                max_pull_concurrency: env_parse(
                    "FEED_MAX_PULL_CONCURRENCY",
                    feed_defaults.max_pull_concurrency,
                )?,
                store_timeout: env_millis("FEED_STORE_TIMEOUT_MS", feed_defaults.store_timeout)?,
                request_timeout: env_millis(
                    "FEED_REQUEST_TIMEOUT_MS",
                    feed_defaults.request_timeout,
                )?,
            },
            cache: CacheConfig {
                feed_ttl: env_parse("FEED_CACHE_TTL_SECS", cache_defaults.feed_ttl)?,
                timeline_ttl: env_parse("TIMELINE_CACHE_TTL_SECS", cache_defaults.timeline_ttl)?,
                max_timeline_items: env_parse(
                    "TIMELINE_CACHE_MAX_ITEMS",
                    cache_defaults.max_timeline_items,
                )?,
                affinity_ttl: env_parse("AFFINITY_CACHE_TTL_SECS", cache_defaults.affinity_ttl)?,
                update_queue_capacity: env_parse(
                    "CACHE_UPDATE_QUEUE_CAPACITY",
                    cache_defaults.update_queue_capacity,
                )?,
                update_max_retries: env_parse(
                    "CACHE_UPDATE_MAX_RETRIES",
                    cache_defaults.update_max_retries,
                )?,
            },
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::error::Error + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| format!("{} is invalid ({}): {}", key, raw, e).into()),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, Box<dyn std::error::Error>> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, Box<dyn std::error::Error>> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_defaults() {
        let config = FanoutConfig::default();
        assert_eq!(config.celebrity_threshold, 100_000);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.follower_page_size, 1000);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_feed_defaults() {
        let config = FeedConfig::default();
        assert_eq!(config.default_limit, 10);
        assert_eq!(config.max_limit, 50);
        assert_eq!(config.pull_window, Duration::from_secs(86_400));
    }

    #[test]
    fn test_env_parse_falls_back_and_rejects_garbage() {
        assert_eq!(env_parse("FEED_TEST_UNSET_KEY_8731", 42u32).unwrap(), 42);

        std::env::set_var("FEED_TEST_BAD_KEY_8731", "not-a-number");
        assert!(env_parse::<u32>("FEED_TEST_BAD_KEY_8731", 1).is_err());
        std::env::remove_var("FEED_TEST_BAD_KEY_8731");
    }
}
