use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub db_path: PathBuf,
    pub db_pool_size: u32,
    pub hot_capacity: u64,
    /// TTL of `conv:hot:*` and `prompt:*` keys.
    pub hot_ttl: Duration,
    pub session_ttl: Duration,
    pub guest_ttl: Duration,
    pub promotion_threshold: i64,
    pub hot_timeout: Duration,
    pub durable_timeout: Duration,
    pub conversation_retention: chrono::Duration,
    pub prompt_retention: chrono::Duration,
    pub export_batch_size: usize,
    pub warehouse_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/gencache.db"),
            db_pool_size: 10,
            hot_capacity: 10_000,
            hot_ttl: Duration::from_secs(3600),
            session_ttl: Duration::from_secs(86_400),
            guest_ttl: Duration::from_secs(86_400),
            promotion_threshold: 5,
            hot_timeout: Duration::from_millis(250),
            durable_timeout: Duration::from_millis(5000),
            conversation_retention: chrono::Duration::days(30),
            prompt_retention: chrono::Duration::days(90),
            export_batch_size: 500,
            warehouse_dir: PathBuf::from("data/warehouse"),
        }
    }
}

/// Read `name`, falling back to `default` when unset. A value that is set
/// but does not parse is an error.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();
        let promotion_threshold: i64 = env_or("PROMOTION_THRESHOLD", defaults.promotion_threshold)?;
        if promotion_threshold < 1 {
            anyhow::bail!("PROMOTION_THRESHOLD must be at least 1, got {}", promotion_threshold);
        }
        let export_batch_size: usize = env_or("EXPORT_BATCH_SIZE", defaults.export_batch_size)?;
        if export_batch_size == 0 {
            anyhow::bail!("EXPORT_BATCH_SIZE must be positive");
        }

        let config = Self {
            db_path: env_or("CACHE_DB_PATH", defaults.db_path)?,
            db_pool_size: env_or("DB_POOL_SIZE", defaults.db_pool_size)?,
            hot_capacity: env_or("HOT_CAPACITY", defaults.hot_capacity)?,
            hot_ttl: Duration::from_secs(env_or("HOT_TTL_SECONDS", 3600)?),
            session_ttl: Duration::from_secs(env_or("SESSION_TTL_SECONDS", 86_400)?),
            guest_ttl: Duration::from_secs(env_or("GUEST_TTL_SECONDS", 86_400)?),
            promotion_threshold,
            hot_timeout: Duration::from_millis(env_or("HOT_TIMEOUT_MS", 250)?),
            durable_timeout: Duration::from_millis(env_or("DURABLE_TIMEOUT_MS", 5000)?),
            conversation_retention: chrono::Duration::days(env_or("CONVERSATION_RETENTION_DAYS", 30)?),
            prompt_retention: chrono::Duration::days(env_or("PROMPT_RETENTION_DAYS", 90)?),
            export_batch_size,
            warehouse_dir: env_or("WAREHOUSE_DIR", defaults.warehouse_dir)?,
        };

        info!(
            "Cache configuration: db {}, hot capacity {}, promotion at {} hits",
            config.db_path.display(),
            config.hot_capacity,
            config.promotion_threshold
        );
        Ok(config)
    }
}
