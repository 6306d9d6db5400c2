//! Configuration schema for Hoard
//!
//! Configuration is stored at `~/.config/hoard/config.toml`

use crate::process::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache location and maintenance settings
    pub cache: CacheConfig,

    /// Remote fetch settings
    pub fetch: FetchConfig,

    /// Archive extraction settings
    pub extract: ExtractConfig,
}

impl Config {
    /// Staleness threshold used by maintenance sweeps
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache.max_age_days) * 24 * 60 * 60)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory (default: platform cache dir + "hoard")
    pub root: Option<PathBuf>,

    /// Entries older than N days are removed by `delete_stale`
    pub max_age_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_age_days: 30,
        }
    }
}

/// Remote fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Downloader used for http, https and ftp
    pub curl: String,

    /// Object-storage copy tool used for gs://
    pub gsutil: String,

    /// Retries after the first failed attempt
    pub retries: u32,

    /// Base sleep between attempts; attempt N waits N * sleep
    pub retry_sleep_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            curl: "curl".to_string(),
            gsutil: "gsutil".to_string(),
            retries: 3,
            retry_sleep_secs: 60,
        }
    }
}

impl FetchConfig {
    /// Retry policy for the network backends
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.retry_sleep_secs))
    }
}

/// Archive extraction configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Extra root searched for decompressors before `/`
    pub chroot: Option<PathBuf>,
}
