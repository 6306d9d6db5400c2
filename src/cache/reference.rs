//! Scoped, locked access to one cache key

use crate::cache::lock::{FileLock, LockMode};
use crate::cache::remote::{FetchOptions, RemoteFetch};
use crate::cache::{Cache, CacheKey};
use crate::error::HoardResult;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A handle bound to one key of one cache.
///
/// `acquire()` takes the key's exclusive lock and `release()` drops it;
/// doing either twice in a row is a programming error and panics. Mutations
/// on a reference that is not acquired take the exclusive lock for just
/// that call. Prefer `enter()`, which returns a guard that releases on drop.
pub struct CacheReference<'a, C: Cache + ?Sized> {
    cache: &'a C,
    key: CacheKey,
    lock: FileLock,
    acquired: bool,
    read_locked: bool,
}

impl<'a, C: Cache + ?Sized> CacheReference<'a, C> {
    /// Bind a reference to `key`; nothing is locked yet
    pub fn new(cache: &'a C, key: CacheKey) -> Self {
        let lock = cache.lock_for_key(&key);
        Self {
            cache,
            key,
            lock,
            acquired: false,
            read_locked: false,
        }
    }

    /// The key this reference is bound to
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Whether `acquire()` is in effect
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Current hold on the key's lock, if any
    pub fn lock_mode(&self) -> Option<LockMode> {
        self.lock.mode()
    }

    /// Path of the entry. Its content is only stable while the lock is held.
    pub fn path(&self) -> PathBuf {
        self.cache.key_path(&self.key)
    }

    /// Block until the key's exclusive lock is held.
    ///
    /// # Panics
    ///
    /// If this reference is already acquired.
    pub async fn acquire(&mut self) -> HoardResult<()> {
        assert!(
            !self.acquired,
            "cache reference {} acquired twice",
            self.key
        );
        self.lock.lock(LockMode::Exclusive).await?;
        self.acquired = true;
        self.read_locked = false;
        Ok(())
    }

    /// Drop the key's lock.
    ///
    /// # Panics
    ///
    /// If this reference is not acquired.
    pub fn release(&mut self) {
        assert!(
            self.acquired,
            "cache reference {} released without being acquired",
            self.key
        );
        self.acquired = false;
        self.read_locked = false;
        if let Err(e) = self.lock.unlock() {
            warn!("{}", e);
        }
    }

    /// Acquire and wrap in a guard that releases when dropped, on every
    /// exit path including `?` and panics
    pub async fn enter(mut self) -> HoardResult<CacheGuard<'a, C>> {
        self.acquire().await?;
        Ok(CacheGuard { reference: self })
    }

    /// Whether the entry is present
    pub fn exists(&self) -> bool {
        self.cache.key_exists(&self.key)
    }

    /// Check for the entry, then keep a shared lock on the key so the
    /// entry cannot change underneath while other readers still get in.
    /// The shared hold lasts until `release()` or drop.
    pub async fn exists_locked(&mut self) -> HoardResult<bool> {
        self.lock.lock(LockMode::Shared).await?;
        self.read_locked = true;
        Ok(self.exists())
    }

    /// Install a private copy of `source` as the entry
    pub async fn assign(&mut self, source: impl AsRef<Path>) -> HoardResult<()> {
        self.begin_write().await?;
        let result = self.cache.insert(&self.key, source.as_ref()).await;
        self.finish_write(result).await
    }

    /// Install `text` as the entry
    pub async fn assign_text(&mut self, text: impl AsRef<[u8]>) -> HoardResult<()> {
        self.begin_write().await?;
        let result = self.cache.insert_text(&self.key, text.as_ref()).await;
        self.finish_write(result).await
    }

    /// `assign(source)` only if the entry is absent, checked and installed
    /// under one continuous hold of the exclusive lock
    pub async fn set_default(&mut self, source: impl AsRef<Path>) -> HoardResult<()> {
        self.begin_write().await?;
        let result = self.insert_if_absent(source.as_ref()).await;
        self.finish_write(result).await
    }

    /// `set_default`, then keep a shared lock like `exists_locked`
    pub async fn set_default_locked(&mut self, source: impl AsRef<Path>) -> HoardResult<()> {
        self.begin_write().await?;
        let result = self.insert_if_absent(source.as_ref()).await;
        if result.is_ok() {
            self.read_locked = true;
        }
        self.finish_write(result).await
    }

    /// Delete the entry; absent entries are fine
    pub async fn remove(&mut self) -> HoardResult<()> {
        self.begin_write().await?;
        let result = self.cache.remove(&self.key).await;
        self.finish_write(result).await
    }

    async fn insert_if_absent(&self, source: &Path) -> HoardResult<()> {
        if self.exists() {
            debug!("{} already cached, keeping it", self.key);
            return Ok(());
        }
        self.cache.insert(&self.key, source).await
    }

    async fn begin_write(&mut self) -> HoardResult<()> {
        self.lock.lock(LockMode::Exclusive).await
    }

    /// Return the lock to the hold the caller had before the write began
    async fn finish_write<T>(&mut self, result: HoardResult<T>) -> HoardResult<T> {
        let restored = if self.read_locked {
            self.lock.lock(LockMode::Shared).await
        } else if !self.acquired {
            self.lock.unlock()
        } else {
            Ok(())
        };
        let value = result?;
        restored?;
        Ok(value)
    }
}

impl<'a, C: RemoteFetch + ?Sized> CacheReference<'a, C> {
    /// Fetch `uri` into this key under the exclusive lock
    pub async fn fetch(&mut self, uri: &str, options: &FetchOptions) -> HoardResult<()> {
        self.begin_write().await?;
        let result = self.cache.fetch(uri, &self.key, options).await;
        self.finish_write(result).await
    }
}

/// An acquired `CacheReference` that releases its lock when dropped
pub struct CacheGuard<'a, C: Cache + ?Sized> {
    reference: CacheReference<'a, C>,
}

impl<'a, C: Cache + ?Sized> Deref for CacheGuard<'a, C> {
    type Target = CacheReference<'a, C>;

    fn deref(&self) -> &Self::Target {
        &self.reference
    }
}

impl<'a, C: Cache + ?Sized> DerefMut for CacheGuard<'a, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reference
    }
}

impl<'a, C: Cache + ?Sized> Drop for CacheGuard<'a, C> {
    fn drop(&mut self) {
        if self.reference.acquired {
            self.reference.release();
        }
    }
}
