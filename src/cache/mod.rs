//! Key-addressed artifact cache
//!
//! Entries live under a shared root and are addressed by `CacheKey`. The
//! root may be used by many processes at once, so every mutation of a key
//! happens under that key's advisory file lock, and content only becomes
//! visible once it is fully written.
//!
//! # Layout
//!
//! | Path | Contents |
//! |------|----------|
//! | `<root>/entries/<name>` | entry file or directory |
//! | `<root>/locks/<name>.lock` | per-key lock file |
//! | `<root>/staging/` | private temp dirs for in-flight installs |
//!
//! # Usage
//!
//! Consumers go through a `CacheReference`: look the key up, enter it
//! (taking the lock), check `exists()`, populate if needed, and let the
//! guard drop to release the lock.

pub mod disk;
pub mod key;
pub mod lock;
pub mod reference;
pub mod remote;

pub use disk::{format_bytes, CacheEntry, DiskCache};
pub use key::CacheKey;
pub use lock::{FileLock, LockMode};
pub use reference::{CacheGuard, CacheReference};
pub use remote::{FetchOptions, RemoteCache, RemoteFetch, TarballCache};

use crate::error::HoardResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Primitive, lock-free storage operations over a key namespace.
///
/// Implementations do no locking of their own; `CacheReference` layers the
/// per-key lock on top of these.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Path of the entry for `key`. Pure: no I/O.
    fn key_path(&self, key: &CacheKey) -> PathBuf;

    /// Path of the lock file guarding `key`
    fn lock_path(&self, key: &CacheKey) -> PathBuf;

    /// Whether an entry is present for `key`
    fn key_exists(&self, key: &CacheKey) -> bool {
        std::fs::symlink_metadata(self.key_path(key)).is_ok()
    }

    /// Install a private copy of `source` as the entry for `key`,
    /// replacing any previous content
    async fn insert(&self, key: &CacheKey, source: &Path) -> HoardResult<()>;

    /// Install `text` as the entry for `key`
    async fn insert_text(&self, key: &CacheKey, text: &[u8]) -> HoardResult<()>;

    /// Delete the entry for `key`; absent keys are not an error
    async fn remove(&self, key: &CacheKey) -> HoardResult<()>;

    /// An unlocked lock handle for `key`
    fn lock_for_key(&self, key: &CacheKey) -> FileLock {
        FileLock::new(self.lock_path(key))
    }

    /// A reference bound to `key`, not yet acquired
    fn lookup(&self, key: CacheKey) -> CacheReference<'_, Self>
    where
        Self: Sized,
    {
        CacheReference::new(self, key)
    }
}
