//! Integration tests for Hoard

use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

mod cache_tests {
    use super::init_tracing;
    use hoard::{Cache, CacheKey, DiskCache, HoardError, HoardResult};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lookup_assign_read() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("cache")).await.unwrap();
        let src = dir.path().join("greeting");
        std::fs::write(&src, "hello").unwrap();

        let key = CacheKey::try_from(["a", "b"]).unwrap();
        {
            let mut guard = cache.lookup(key.clone()).enter().await.unwrap();
            assert!(!guard.exists());
            guard.assign(&src).await.unwrap();
            assert!(guard.exists());
            assert_eq!(std::fs::read_to_string(guard.path()).unwrap(), "hello");
        }

        let keys = cache.list_keys().await.unwrap();
        assert!(keys.contains(&key));
    }

    #[tokio::test]
    async fn paths_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::try_from(["toolchain", "x86_64-cros-linux-gnu"]).unwrap();

        let first = DiskCache::new(dir.path()).await.unwrap();
        first.lookup(key.clone()).assign_text("bits").await.unwrap();
        let path = first.key_path(&key);
        drop(first);

        let second = DiskCache::new(dir.path()).await.unwrap();
        assert_eq!(second.key_path(&key), path);
        assert!(second.lookup(key).exists());
    }

    #[tokio::test]
    async fn scoped_use_releases_after_error() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path()).await.unwrap();
        let key = CacheKey::try_from("k").unwrap();

        async fn failing_stage(cache: &DiskCache, key: CacheKey) -> HoardResult<()> {
            let mut guard = cache.lookup(key).enter().await?;
            guard.assign_text("partial").await?;
            Err(HoardError::Internal("stage failed".to_string()))
        }
        assert!(failing_stage(&cache, key.clone()).await.is_err());

        // A fresh reference can take the lock straight away.
        let guard = tokio::time::timeout(
            Duration::from_secs(5),
            cache.lookup(key).enter(),
        )
        .await
        .expect("lock should have been released")
        .unwrap();
        assert!(guard.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_serialize() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        DiskCache::new(&root).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let root = root.clone();
            tasks.push(tokio::spawn(async move {
                // Separate instances share nothing but the directory.
                let cache = DiskCache::new(root).await.unwrap();
                let mut guard = cache
                    .lookup(CacheKey::try_from("counter").unwrap())
                    .enter()
                    .await
                    .unwrap();
                let current = if guard.exists() {
                    std::fs::read_to_string(guard.path())
                        .unwrap()
                        .parse::<u32>()
                        .unwrap()
                } else {
                    0
                };
                tokio::time::sleep(Duration::from_millis(10)).await;
                guard.assign_text((current + 1).to_string()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let cache = DiskCache::new(&root).await.unwrap();
        let path = cache.key_path(&CacheKey::try_from("counter").unwrap());
        assert_eq!(std::fs::read_to_string(path).unwrap(), "8");
    }

    #[tokio::test]
    async fn held_key_blocks_other_references() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path()).await.unwrap();
        let key = CacheKey::try_from("busy").unwrap();

        let holder = cache.lookup(key.clone()).enter().await.unwrap();
        let waiting =
            tokio::time::timeout(Duration::from_millis(200), cache.lookup(key.clone()).enter())
                .await;
        assert!(waiting.is_err(), "second reference should block");
        drop(holder);

        tokio::time::timeout(Duration::from_secs(5), cache.lookup(key).enter())
            .await
            .expect("lock should be free once the holder is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_spares_fresh_entries() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path()).await.unwrap();
        for name in ["old", "new"] {
            cache
                .lookup(CacheKey::try_from(name).unwrap())
                .assign_text(name)
                .await
                .unwrap();
        }

        let old = cache.key_path(&CacheKey::try_from("old").unwrap());
        let long_ago = std::time::SystemTime::now() - Duration::from_secs(90 * 86_400);
        filetime::set_file_mtime(&old, filetime::FileTime::from_system_time(long_ago)).unwrap();

        let removed = cache
            .delete_stale(Duration::from_secs(30 * 86_400))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let keys = cache.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&CacheKey::try_from("new").unwrap()));
    }
}

mod process_tests {
    use hoard::{Cache, CacheKey, DiskCache};
    use std::path::Path;
    use std::process::Stdio;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Set in the child: the cache root whose key the child should hold
    const HOLDER_ROOT: &str = "HOARD_TEST_HOLDER_ROOT";
    const HOLDER_TEST: &str = "process_tests::hold_key_in_child";
    const HELD_MARKER: &str = "held";

    fn shared_key() -> CacheKey {
        CacheKey::try_from(["shared", "artifact"]).unwrap()
    }

    /// Runs only as the child of `other_process_holds_until_killed`
    #[tokio::test]
    async fn hold_key_in_child() {
        let Ok(root) = std::env::var(HOLDER_ROOT) else {
            return;
        };
        let cache = DiskCache::new(&root).await.unwrap();
        let _guard = cache.lookup(shared_key()).enter().await.unwrap();
        std::fs::write(Path::new(&root).join(HELD_MARKER), "").unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
    }

    #[tokio::test]
    async fn other_process_holds_until_killed() {
        super::init_tracing();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let cache = DiskCache::new(&root).await.unwrap();

        let mut child = tokio::process::Command::new(std::env::current_exe().unwrap())
            .args([HOLDER_TEST, "--exact", "--nocapture", "--test-threads=1"])
            .env(HOLDER_ROOT, &root)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let started = Instant::now();
        while !root.join(HELD_MARKER).exists() {
            assert!(
                started.elapsed() < Duration::from_secs(30),
                "child never took the lock"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let blocked =
            tokio::time::timeout(Duration::from_millis(300), cache.lookup(shared_key()).enter())
                .await;
        assert!(blocked.is_err(), "lock held by another process must block");

        // A crashed holder must not leave the key locked.
        child.kill().await.unwrap();
        let mut guard = tokio::time::timeout(
            Duration::from_secs(5),
            cache.lookup(shared_key()).enter(),
        )
        .await
        .expect("lock should be released when the holder dies")
        .unwrap();
        assert!(!guard.exists());
        guard.assign_text("recovered").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(cache.key_path(&shared_key())).unwrap(),
            "recovered"
        );
    }
}

mod remote_tests {
    use super::init_tracing;
    use hoard::fetch::FetchBackend;
    use hoard::{Cache, CacheKey, FetchOptions, HoardResult, RemoteCache, TarballCache};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use url::Url;

    struct FixedBytes(&'static str);

    #[async_trait::async_trait]
    impl FetchBackend for FixedBytes {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn fetch(&self, _url: &Url, dest: &Path) -> HoardResult<()> {
            tokio::fs::write(dest, self.0)
                .await
                .map_err(|e| hoard::HoardError::io("stub write", e))
        }
    }

    #[tokio::test]
    async fn fetch_from_stubbed_bucket() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut cache = RemoteCache::new(dir.path()).await.unwrap();
        cache
            .backends_mut()
            .register("gs", Arc::new(FixedBytes("hello")));

        let key = CacheKey::try_from("gs").unwrap();
        let mut guard = cache.lookup(key).enter().await.unwrap();
        let options = FetchOptions::new()
            .with_sha1("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
            .with_mode(0o644);
        guard.fetch("gs://bucket/object", &options).await.unwrap();
        assert_eq!(std::fs::read_to_string(guard.path()).unwrap(), "hello");
    }

    #[tokio::test]
    async fn bad_digest_is_cache_error() {
        let dir = TempDir::new().unwrap();
        let mut cache = RemoteCache::new(dir.path()).await.unwrap();
        cache
            .backends_mut()
            .register("https", Arc::new(FixedBytes("tampered")));

        let mut reference = cache.lookup(CacheKey::try_from("sdk").unwrap());
        let err = reference
            .fetch(
                "https://mirror.example/sdk.tar.xz",
                &FetchOptions::new().with_sha1("da39a3ee5e6b4b0d3255bfef95601890afd80709"),
            )
            .await
            .unwrap_err();
        assert!(err.is_cache_error());
        assert!(!reference.exists());
    }

    #[tokio::test]
    async fn tarball_fetch_then_extract() {
        init_tracing();
        let dir = TempDir::new().unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "bin/tool", "tool!".as_bytes())
            .unwrap();
        let archive = dir.path().join("tool.tar");
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let cache = TarballCache::new(dir.path().join("cache")).await.unwrap();
        let guard = {
            let mut guard = cache
                .lookup(CacheKey::try_from(["tool", "1.0"]).unwrap())
                .enter()
                .await
                .unwrap();
            if !guard.exists() {
                guard.assign(&archive).await.unwrap();
            }
            guard
        };

        let out = dir.path().join("unpacked");
        hoard::archive::untar(&guard.path(), &out).await.unwrap();
        assert_eq!(std::fs::read_to_string(out.join("bin/tool")).unwrap(), "tool!");
    }
}

mod config_tests {
    use hoard::config::{Config, ConfigManager};
    use hoard::{Cache, CacheKey, RemoteCache};
    use tempfile::TempDir;

    #[tokio::test]
    async fn cache_from_saved_config() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml"));

        let mut config = Config::default();
        config.cache.root = Some(dir.path().join("root"));
        config.fetch.retries = 0;
        manager.save(&config).await.unwrap();

        let loaded = manager.load().await.unwrap();
        let cache = RemoteCache::from_config(&loaded).await.unwrap();
        assert_eq!(cache.disk().root(), dir.path().join("root"));

        let key = CacheKey::try_from("k").unwrap();
        assert!(cache.key_path(&key).starts_with(dir.path().join("root")));
    }
}
