use crate::retry::RetryPolicy;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub version: u32,
    pub concurrency: ConcurrencyConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    pub lock_timeout: Duration,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter: bool,
    pub subscription_workers: usize,
    pub max_queue_size: usize,
    pub notification_workers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub pool_size: usize,
    pub busy_timeout: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(2),
            retry_jitter: false,
            subscription_workers: 5,
            max_queue_size: 100,
            notification_workers: 4,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: 20,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            concurrency: ConcurrencyConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay, self.retry_max_delay)
            .with_jitter(self.retry_jitter)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    version: Option<u32>,
    concurrency: Option<RawConcurrencyConfig>,
    storage: Option<RawStorageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConcurrencyConfig {
    lock_timeout: Option<f64>,
    max_retries: Option<usize>,
    retry_base_delay: Option<f64>,
    retry_max_delay: Option<f64>,
    retry_jitter: Option<bool>,
    subscription_workers: Option<usize>,
    max_queue_size: Option<usize>,
    notification_workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorageConfig {
    path: Option<String>,
    pool_size: Option<usize>,
    busy_timeout: Option<f64>,
}

pub fn default_db_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("turnstile").join("turnstile.db");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("state")
            .join("turnstile")
            .join("turnstile.db");
    }
    PathBuf::from(".turnstile/turnstile.db")
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("turnstile").join("config.toml"));
    }
    std::env::var("HOME").ok().map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("turnstile")
            .join("config.toml")
    })
}

pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            path.to_path_buf()
        }
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };
    let raw =
        std::fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
    parse_config(&raw, &path)
}

pub fn parse_config(raw: &str, path: &Path) -> Result<Config> {
    let parsed: RawConfig =
        toml::from_str(raw).with_context(|| format!("parse {}", path.display()))?;
    validate_config(parsed, path)
}

fn validate_config(raw: RawConfig, path: &Path) -> Result<Config> {
    let version = raw
        .version
        .ok_or_else(|| anyhow::anyhow!("{} missing required `version`", path.display()))?;
    if version != CONFIG_VERSION {
        bail!(
            "{} has unsupported version {version}; expected version = {CONFIG_VERSION}",
            path.display()
        );
    }

    let concurrency = raw
        .concurrency
        .map(|c| validate_concurrency(c, path))
        .transpose()?
        .unwrap_or_default();
    let storage = raw
        .storage
        .map(|s| validate_storage(s, path))
        .transpose()?
        .unwrap_or_default();

    Ok(Config {
        version,
        concurrency,
        storage,
    })
}

fn validate_concurrency(raw: RawConcurrencyConfig, path: &Path) -> Result<ConcurrencyConfig> {
    let defaults = ConcurrencyConfig::default();
    let cfg = ConcurrencyConfig {
        lock_timeout: seconds(raw.lock_timeout, defaults.lock_timeout, "lock_timeout", path)?,
        max_retries: raw.max_retries.unwrap_or(defaults.max_retries),
        retry_base_delay: seconds(
            raw.retry_base_delay,
            defaults.retry_base_delay,
            "retry_base_delay",
            path,
        )?,
        retry_max_delay: seconds(
            raw.retry_max_delay,
            defaults.retry_max_delay,
            "retry_max_delay",
            path,
        )?,
        retry_jitter: raw.retry_jitter.unwrap_or(defaults.retry_jitter),
        subscription_workers: positive(
            raw.subscription_workers,
            defaults.subscription_workers,
            "subscription_workers",
            path,
        )?,
        max_queue_size: positive(
            raw.max_queue_size,
            defaults.max_queue_size,
            "max_queue_size",
            path,
        )?,
        notification_workers: positive(
            raw.notification_workers,
            defaults.notification_workers,
            "notification_workers",
            path,
        )?,
    };
    if cfg.retry_base_delay > cfg.retry_max_delay {
        bail!(
            "{} has `[concurrency].retry_base_delay` greater than `retry_max_delay`",
            path.display()
        );
    }
    Ok(cfg)
}

fn validate_storage(raw: RawStorageConfig, path: &Path) -> Result<StorageConfig> {
    let defaults = StorageConfig::default();
    let db_path = raw
        .path
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or(defaults.path);
    Ok(StorageConfig {
        path: db_path,
        pool_size: positive(raw.pool_size, defaults.pool_size, "pool_size", path)?,
        busy_timeout: seconds(raw.busy_timeout, defaults.busy_timeout, "busy_timeout", path)?,
    })
}

fn seconds(value: Option<f64>, default: Duration, key: &str, path: &Path) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
            anyhow::anyhow!(
                "{} has invalid `{key} = {secs}`; expected a non-negative number of seconds",
                path.display()
            )
        }),
    }
}

fn positive(value: Option<usize>, default: usize, key: &str, path: &Path) -> Result<usize> {
    match value {
        None => Ok(default),
        Some(0) => bail!("{} has `{key} = 0`; expected at least 1", path.display()),
        Some(n) => Ok(n),
    }
}
