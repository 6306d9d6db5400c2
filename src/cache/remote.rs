//! Caches populated from URIs
//!
//! `RemoteCache` adds fetch-then-install on top of `DiskCache`: the source
//! is pulled into a staging directory by the backend registered for its
//! scheme, optionally verified and chmod-ed there, and only then published.

use crate::cache::disk::{CacheEntry, DiskCache};
use crate::cache::{Cache, CacheKey};
use crate::config::Config;
use crate::error::{HoardError, HoardResult};
use crate::fetch::{resolve_uri, BackendTable, FetchBackend};
use crate::hash::sha1_file;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Optional checks applied to fetched content before it is installed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Expected SHA-1 of the content, hex, any case
    pub sha1: Option<String>,
    /// Permission bits for the installed file
    pub mode: Option<u32>,
}

impl FetchOptions {
    /// No verification, default permissions
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the content to hash to `sha1`
    pub fn with_sha1(mut self, sha1: impl Into<String>) -> Self {
        self.sha1 = Some(sha1.into());
        self
    }

    /// Install with exactly these permission bits
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// A cache that can populate a key from a URI
#[async_trait]
pub trait RemoteFetch: Cache {
    /// Fetch `uri` and install it as the entry for `key`.
    ///
    /// Callers hold the key's exclusive lock; `CacheReference::fetch` does
    /// this. On any failure the entry is left as it was.
    async fn fetch(&self, uri: &str, key: &CacheKey, options: &FetchOptions) -> HoardResult<()>;
}

/// A `DiskCache` whose inserts fetch from URIs
#[derive(Debug, Clone)]
pub struct RemoteCache {
    disk: DiskCache,
    backends: BackendTable,
}

impl RemoteCache {
    /// Open a cache at `root` with the standard backends
    pub async fn new(root: impl Into<PathBuf>) -> HoardResult<Self> {
        Ok(Self::with_backends(
            DiskCache::new(root).await?,
            BackendTable::default(),
        ))
    }

    /// Wrap an open `DiskCache` with a custom backend table
    pub fn with_backends(disk: DiskCache, backends: BackendTable) -> Self {
        Self { disk, backends }
    }

    /// Open the cache root and backends named by `config`
    pub async fn from_config(config: &Config) -> HoardResult<Self> {
        Ok(Self::with_backends(
            DiskCache::from_config(config).await?,
            BackendTable::from_config(&config.fetch),
        ))
    }

    /// The underlying local cache
    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// The scheme table
    pub fn backends(&self) -> &BackendTable {
        &self.backends
    }

    /// The scheme table, for registering or replacing backends
    pub fn backends_mut(&mut self) -> &mut BackendTable {
        &mut self.backends
    }

    /// See `DiskCache::list_keys`
    pub async fn list_keys(&self) -> HoardResult<HashSet<CacheKey>> {
        self.disk.list_keys().await
    }

    /// See `DiskCache::entries`
    pub async fn entries(&self) -> HoardResult<Vec<CacheEntry>> {
        self.disk.entries().await
    }

    /// See `DiskCache::delete_stale`
    pub async fn delete_stale(&self, max_age: Duration) -> HoardResult<usize> {
        self.disk.delete_stale(max_age).await
    }

    /// See `DiskCache::delete_stale_at`
    pub async fn delete_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> HoardResult<usize> {
        self.disk.delete_stale_at(max_age, now).await
    }
}

#[async_trait]
impl RemoteFetch for RemoteCache {
    async fn fetch(&self, uri: &str, key: &CacheKey, options: &FetchOptions) -> HoardResult<()> {
        let url = resolve_uri(uri)?;
        let backend =
            self.backends
                .get(url.scheme())
                .ok_or_else(|| HoardError::UnsupportedScheme {
                    uri: uri.to_string(),
                    scheme: url.scheme().to_string(),
                })?;

        let staged = self.disk.stage()?;
        let content = staged.content();
        debug!("Fetching {} for {} via {}", url, key, backend.name());
        backend.fetch(&url, &content).await?;

        if let Some(expected) = &options.sha1 {
            let actual = sha1_file(&content).await?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(HoardError::HashMismatch {
                    origin: uri.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("{} matches SHA-1 {}", uri, actual);
        }

        if let Some(mode) = options.mode {
            set_mode(&content, mode).await?;
        }

        self.disk.publish(key, staged).await?;
        info!("Fetched {} into {}", uri, key);
        Ok(())
    }
}

#[async_trait]
impl Cache for RemoteCache {
    fn key_path(&self, key: &CacheKey) -> PathBuf {
        self.disk.key_path(key)
    }

    fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.disk.lock_path(key)
    }

    /// `source` is a URI, or a plain local path
    async fn insert(&self, key: &CacheKey, source: &Path) -> HoardResult<()> {
        match source.to_str() {
            Some(uri) => self.fetch(uri, key, &FetchOptions::default()).await,
            None => self.disk.insert(key, source).await,
        }
    }

    async fn insert_text(&self, key: &CacheKey, text: &[u8]) -> HoardResult<()> {
        self.disk.insert_text(key, text).await
    }

    async fn remove(&self, key: &CacheKey) -> HoardResult<()> {
        self.disk.remove(key).await
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> HoardResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let perms = std::fs::Permissions::from_mode(mode & 0o7777);
    tokio::fs::set_permissions(path, perms)
        .await
        .map_err(|e| HoardError::io(format!("setting mode {:o} on {}", mode, path.display()), e))
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> HoardResult<()> {
    debug!("Ignoring mode {:o} for {} on this platform", mode, path.display());
    Ok(())
}

/// A remote cache holding archives.
///
/// Fetching works exactly as for `RemoteCache`; entries are meant to be
/// unpacked with `archive::untar` by whoever looks them up.
#[derive(Debug, Clone)]
pub struct TarballCache {
    remote: RemoteCache,
}

impl TarballCache {
    /// Open a cache at `root` with the standard backends
    pub async fn new(root: impl Into<PathBuf>) -> HoardResult<Self> {
        Ok(Self {
            remote: RemoteCache::new(root).await?,
        })
    }

    /// Wrap an open `DiskCache` with a custom backend table
    pub fn with_backends(disk: DiskCache, backends: BackendTable) -> Self {
        Self {
            remote: RemoteCache::with_backends(disk, backends),
        }
    }

    /// Open the cache root and backends named by `config`
    pub async fn from_config(config: &Config) -> HoardResult<Self> {
        Ok(Self {
            remote: RemoteCache::from_config(config).await?,
        })
    }

    /// The underlying remote cache
    pub fn remote(&self) -> &RemoteCache {
        &self.remote
    }

    /// The local store entries are installed into
    pub fn disk(&self) -> &DiskCache {
        self.remote.disk()
    }

    pub fn backends(&self) -> &BackendTable {
        self.remote.backends()
    }

    /// The scheme table, for registering or replacing backends
    pub fn backends_mut(&mut self) -> &mut BackendTable {
        self.remote.backends_mut()
    }

    /// See `DiskCache::list_keys`
    pub async fn list_keys(&self) -> HoardResult<HashSet<CacheKey>> {
        self.remote.list_keys().await
    }

    /// See `DiskCache::entries`
    pub async fn entries(&self) -> HoardResult<Vec<CacheEntry>> {
        self.remote.entries().await
    }

    /// See `DiskCache::delete_stale`
    pub async fn delete_stale(&self, max_age: Duration) -> HoardResult<usize> {
        self.remote.delete_stale(max_age).await
    }

    /// See `DiskCache::delete_stale_at`
    pub async fn delete_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> HoardResult<usize> {
        self.remote.delete_stale_at(max_age, now).await
    }
}

impl From<RemoteCache> for TarballCache {
    fn from(remote: RemoteCache) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl RemoteFetch for TarballCache {
    async fn fetch(&self, uri: &str, key: &CacheKey, options: &FetchOptions) -> HoardResult<()> {
        self.remote.fetch(uri, key, options).await
    }
}

#[async_trait]
impl Cache for TarballCache {
    fn key_path(&self, key: &CacheKey) -> PathBuf {
        self.remote.key_path(key)
    }

    fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.remote.lock_path(key)
    }

    async fn insert(&self, key: &CacheKey, source: &Path) -> HoardResult<()> {
        self.remote.insert(key, source).await
    }

    async fn insert_text(&self, key: &CacheKey, text: &[u8]) -> HoardResult<()> {
        self.remote.insert_text(key, text).await
    }

    async fn remove(&self, key: &CacheKey) -> HoardResult<()> {
        self.remote.remove(key).await
    }
}
