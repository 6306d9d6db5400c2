//! Remote fetch backends
//!
//! A backend copies the object named by a URL to a local path. Backends are
//! selected by URL scheme through an explicit `BackendTable`; the remote
//! cache stages, verifies and publishes whatever they produce.

pub mod curl;
pub mod file;
pub mod gsutil;

pub use curl::CurlBackend;
pub use file::FileBackend;
pub use gsutil::GsutilBackend;

use crate::config::FetchConfig;
use crate::error::{HoardError, HoardResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use url::Url;

/// A transport able to copy one remote object to a local path
#[async_trait]
pub trait FetchBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Copy the object at `url` to `dest`. `dest` does not exist yet and
    /// its parent does.
    async fn fetch(&self, url: &Url, dest: &Path) -> HoardResult<()>;
}

/// Scheme to backend map
#[derive(Clone)]
pub struct BackendTable {
    backends: HashMap<String, Arc<dyn FetchBackend>>,
}

impl BackendTable {
    /// A table with no schemes registered
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// The standard table with tools and retry policy taken from `config`
    pub fn from_config(config: &FetchConfig) -> Self {
        let retry = config.retry_policy();
        let curl: Arc<dyn FetchBackend> = Arc::new(CurlBackend::new(&config.curl, retry));

        let mut table = Self::empty();
        table.register("file", Arc::new(FileBackend));
        for scheme in ["http", "https", "ftp"] {
            table.register(scheme, Arc::clone(&curl));
        }
        table.register("gs", Arc::new(GsutilBackend::new(&config.gsutil, retry)));
        table
    }

    /// Register `backend` for `scheme`, returning the one it replaces
    pub fn register(
        &mut self,
        scheme: impl Into<String>,
        backend: Arc<dyn FetchBackend>,
    ) -> Option<Arc<dyn FetchBackend>> {
        self.backends
            .insert(scheme.into().to_ascii_lowercase(), backend)
    }

    /// Backend for `scheme`, if any
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn FetchBackend>> {
        self.backends.get(&scheme.to_ascii_lowercase()).cloned()
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl Default for BackendTable {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

impl fmt::Debug for BackendTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for scheme in self.schemes() {
            if let Some(backend) = self.backends.get(scheme) {
                map.entry(&scheme, &backend.name());
            }
        }
        map.finish()
    }
}

/// Parse a fetch source. Strings without a scheme are local paths.
pub fn resolve_uri(uri: &str) -> HoardResult<Url> {
    let invalid = |reason: String| HoardError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };

    match Url::parse(uri) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = std::path::absolute(uri).map_err(|e| invalid(e.to_string()))?;
            Url::from_file_path(&path)
                .map_err(|()| invalid(format!("{} is not a usable local path", path.display())))
        }
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Write an executable shell script standing in for an external tool
#[cfg(all(test, unix))]
pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
