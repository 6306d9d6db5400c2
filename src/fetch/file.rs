//! `file://` sources

use crate::cache::disk::copy_entry;
use crate::error::{HoardError, HoardResult};
use crate::fetch::FetchBackend;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;
use url::Url;

/// Copies local files (or directory trees) into the cache
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBackend;

#[async_trait]
impl FetchBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, url: &Url, dest: &Path) -> HoardResult<()> {
        let source = url.to_file_path().map_err(|()| HoardError::InvalidUri {
            uri: url.to_string(),
            reason: "not a local file path".to_string(),
        })?;
        debug!("Copying {} to {}", source.display(), dest.display());
        copy_entry(&source, dest).await
    }
}
