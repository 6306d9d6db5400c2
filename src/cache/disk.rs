//! Local on-disk cache
//!
//! Content is never written in place. Every install goes to a private
//! staging directory under the root and is renamed over the entry path once
//! complete, so a reader that sees an entry always sees all of it.

use crate::cache::key::LOCK_SUFFIX;
use crate::cache::{Cache, CacheKey};
use crate::config::{Config, ConfigManager};
use crate::error::{HoardError, HoardResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Subdirectory holding entries
pub const ENTRIES_DIR: &str = "entries";
/// Subdirectory holding per-key lock files
pub const LOCKS_DIR: &str = "locks";
/// Subdirectory holding in-flight installs
pub const STAGING_DIR: &str = "staging";

/// Name of the content inside a staging directory
const STAGED_CONTENT: &str = "content";

/// Prefix of each install's private directory under `staging/`
const STAGE_PREFIX: &str = ".stage-";

/// Installs touched this recently are never swept, whatever the max age
const STAGE_GRACE: Duration = Duration::from_secs(60 * 60);

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One present entry, as seen when enumerating the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Key the entry belongs to
    pub key: CacheKey,
    /// Entry path
    pub path: PathBuf,
    /// Last modification, the staleness signal
    pub modified: DateTime<Utc>,
    /// Size in bytes, summed over a directory tree
    pub size_bytes: u64,
}

/// An install in progress. Dropping it discards the staged content.
#[derive(Debug)]
pub(crate) struct StagedEntry {
    dir: TempDir,
}

impl StagedEntry {
    /// Where the content being installed must be written
    pub(crate) fn content(&self) -> PathBuf {
        self.dir.path().join(STAGED_CONTENT)
    }
}

/// A cache rooted at a local directory
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Open (creating if needed) a cache at `root`
    pub async fn new(root: impl Into<PathBuf>) -> HoardResult<Self> {
        let root = root.into();
        for dir in [ENTRIES_DIR, LOCKS_DIR, STAGING_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| HoardError::io(format!("creating {}", path.display()), e))?;
        }
        debug!("Opened cache at {}", root.display());
        Ok(Self { root })
    }

    /// Open the cache root named by `config`
    pub async fn from_config(config: &Config) -> HoardResult<Self> {
        Self::new(ConfigManager::cache_root(config)).await
    }

    /// The cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join(ENTRIES_DIR)
    }

    /// Begin an install: a fresh private directory on the cache's filesystem
    pub(crate) fn stage(&self) -> HoardResult<StagedEntry> {
        let staging = self.root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging)
            .map_err(|e| HoardError::io(format!("creating {}", staging.display()), e))?;
        let dir = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempdir_in(&staging)
            .map_err(|e| HoardError::io(format!("staging in {}", staging.display()), e))?;
        Ok(StagedEntry { dir })
    }

    /// Make staged content the entry for `key`.
    ///
    /// Must run under the key's exclusive lock. Replacing a file is a single
    /// rename; a directory on either side is removed first.
    pub(crate) async fn publish(&self, key: &CacheKey, staged: StagedEntry) -> HoardResult<()> {
        let content = staged.content();
        let target = self.key_path(key);

        let now = FileTime::now();
        filetime::set_symlink_file_times(&content, now, now)
            .map_err(|e| HoardError::io(format!("touching {}", content.display()), e))?;

        let staged_is_dir = fs::symlink_metadata(&content)
            .await
            .map(|m| m.is_dir())
            .map_err(|e| HoardError::io(format!("reading {}", content.display()), e))?;
        let existing_is_dir = match fs::symlink_metadata(&target).await {
            Ok(meta) => Some(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(HoardError::io(format!("reading {}", target.display()), e)),
        };
        if existing_is_dir == Some(true) || (staged_is_dir && existing_is_dir.is_some()) {
            remove_path(&target).await?;
        }

        fs::rename(&content, &target).await.map_err(|e| {
            HoardError::io(
                format!("publishing {} to {}", content.display(), target.display()),
                e,
            )
        })?;
        info!("Cached {} at {}", key, target.display());
        Ok(())
    }

    /// Every key with a present entry. Names that do not decode to a key
    /// are skipped.
    pub async fn list_keys(&self) -> HoardResult<HashSet<CacheKey>> {
        let dir = self.entries_dir();
        let mut keys = HashSet::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(HoardError::io(format!("listing {}", dir.display()), e)),
        };

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| HoardError::io(format!("listing {}", dir.display()), e))?
        {
            let name = entry.file_name();
            match name.to_str().and_then(CacheKey::from_file_name) {
                Some(key) => {
                    keys.insert(key);
                }
                None => warn!("Skipping unrecognised cache entry {:?}", name),
            }
        }
        Ok(keys)
    }

    /// Present entries with their timestamps and sizes, ordered by key
    pub async fn entries(&self) -> HoardResult<Vec<CacheEntry>> {
        let keys = self.list_keys().await?;
        let paths: Vec<(CacheKey, PathBuf)> = keys
            .into_iter()
            .map(|key| {
                let path = self.key_path(&key);
                (key, path)
            })
            .collect();

        let mut entries = tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .filter_map(|(key, path)| match describe(&path) {
                    Ok((modified, size_bytes)) => Some(Ok(CacheEntry {
                        key,
                        path,
                        modified,
                        size_bytes,
                    })),
                    // Removed since it was listed.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                    Err(e) => Some(Err(HoardError::io(format!("inspecting {}", path.display()), e))),
                })
                .collect::<HoardResult<Vec<_>>>()
        })
        .await
        .map_err(|e| HoardError::Internal(format!("entry scan task: {}", e)))??;

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Total bytes held by present entries
    pub async fn usage(&self) -> HoardResult<u64> {
        Ok(self.entries().await?.iter().map(|e| e.size_bytes).sum())
    }

    /// Remove entries last modified more than `max_age` ago; returns how many
    pub async fn delete_stale(&self, max_age: Duration) -> HoardResult<usize> {
        self.delete_stale_at(max_age, Utc::now()).await
    }

    /// `delete_stale` as if the current time were `now`.
    ///
    /// Each candidate is re-checked under its key's exclusive lock, so an
    /// entry rewritten since the scan survives. Installs abandoned in
    /// `staging/` by a dead process are swept by the same age rule but are
    /// not counted.
    pub async fn delete_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> HoardResult<usize> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            // Older than representable time: nothing can be that stale.
            return Ok(0);
        };

        let mut removed = 0;
        let mut reclaimed = 0;
        for entry in self.entries().await? {
            if entry.modified >= cutoff {
                continue;
            }

            let mut guard = self.lookup(entry.key.clone()).enter().await?;
            let still_stale = match modified_at(&guard.path()) {
                Ok(modified) => modified < cutoff,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => {
                    return Err(HoardError::io(
                        format!("inspecting {}", guard.path().display()),
                        e,
                    ))
                }
            };
            if !still_stale {
                debug!("{} was refreshed during the sweep, keeping it", entry.key);
                continue;
            }

            guard.remove().await?;
            debug!("Removed stale entry {} (modified {})", entry.key, entry.modified);
            removed += 1;
            reclaimed += entry.size_bytes;
        }

        if removed > 0 {
            info!(
                "Removed {} stale entries from {}, reclaimed {}",
                removed,
                self.root.display(),
                format_bytes(reclaimed)
            );
        }

        let stage_cutoff = chrono::Duration::from_std(STAGE_GRACE)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace))
            .map_or(cutoff, |grace_cutoff| cutoff.min(grace_cutoff));
        self.sweep_staging(stage_cutoff).await?;
        Ok(removed)
    }

    /// Remove install directories last touched before `cutoff`
    async fn sweep_staging(&self, cutoff: DateTime<Utc>) -> HoardResult<()> {
        let staging = self.root.join(STAGING_DIR);
        let mut read_dir = match fs::read_dir(&staging).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(HoardError::io(format!("listing {}", staging.display()), e)),
        };

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| HoardError::io(format!("listing {}", staging.display()), e))?
        {
            let is_stage = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(STAGE_PREFIX));
            if !is_stage {
                continue;
            }

            let path = entry.path();
            match staged_at(&path) {
                Ok(touched) if touched < cutoff => {
                    remove_path(&path).await?;
                    warn!("Removed abandoned install {}", path.display());
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(HoardError::io(format!("inspecting {}", path.display()), e))
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for DiskCache {
    fn key_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir().join(key.file_name())
    }

    fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(LOCKS_DIR)
            .join(format!("{}{}", key.file_name(), LOCK_SUFFIX))
    }

    async fn insert(&self, key: &CacheKey, source: &Path) -> HoardResult<()> {
        let staged = self.stage()?;
        copy_entry(source, &staged.content()).await?;
        self.publish(key, staged).await
    }

    async fn insert_text(&self, key: &CacheKey, text: &[u8]) -> HoardResult<()> {
        let staged = self.stage()?;
        let content = staged.content();
        fs::write(&content, text)
            .await
            .map_err(|e| HoardError::io(format!("writing {}", content.display()), e))?;
        self.publish(key, staged).await
    }

    async fn remove(&self, key: &CacheKey) -> HoardResult<()> {
        remove_path(&self.key_path(key)).await
    }
}

/// Copy a file, or a directory tree with its symlinks recreated, to `dest`
pub(crate) async fn copy_entry(source: &Path, dest: &Path) -> HoardResult<()> {
    let meta = fs::metadata(source)
        .await
        .map_err(|e| HoardError::io(format!("reading {}", source.display()), e))?;

    if !meta.is_dir() {
        fs::copy(source, dest).await.map_err(|e| {
            HoardError::io(
                format!("copying {} to {}", source.display(), dest.display()),
                e,
            )
        })?;
        return Ok(());
    }

    let (src, dst) = (source.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
        .await
        .map_err(|e| HoardError::Internal(format!("copy task: {}", e)))?
        .map_err(|e| {
            HoardError::io(
                format!("copying {} to {}", source.display(), dest.display()),
                e,
            )
        })
}

fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove a file or tree; absent paths are fine
async fn remove_path(path: &Path) -> HoardResult<()> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HoardError::io(format!("removing {}", path.display()), e)),
    }
}

fn modified_at(path: &Path) -> io::Result<DateTime<Utc>> {
    Ok(std::fs::symlink_metadata(path)?.modified()?.into())
}

/// Latest activity in a staging directory: its own mtime or its content's
fn staged_at(dir: &Path) -> io::Result<DateTime<Utc>> {
    let own = modified_at(dir)?;
    match modified_at(&dir.join(STAGED_CONTENT)) {
        Ok(content) => Ok(own.max(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(own),
        Err(e) => Err(e),
    }
}

fn describe(path: &Path) -> io::Result<(DateTime<Utc>, u64)> {
    let modified = modified_at(path)?;
    let mut size = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            size += entry.metadata()?.len();
        }
    }
    Ok((modified, size))
}
