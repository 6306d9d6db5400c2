//! Extracting tarballs with the system `tar`

use crate::archive::compression::{find_compressor, CompressionType};
use crate::config::Config;
use crate::error::{HoardError, HoardResult};
use crate::process::ToolCommand;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

/// Flag letting pbzip2 accept the zero padding some producers append
const PBZIP2_TRAILING_GARBAGE: &str = "--ignore-trailing-garbage=1";

/// A fully resolved `tar` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractPlan {
    /// Archive to read
    pub archive: PathBuf,
    /// Directory the archive is unpacked into
    pub dest: PathBuf,
    /// Detected compression
    pub compression: CompressionType,
    /// Decompressor handed to `tar -I`; absent for plain archives
    pub decompressor: Option<OsString>,
}

impl ExtractPlan {
    /// Plan extraction of `archive` into `dest` with `compressor` for
    /// compressed input
    pub fn new(
        archive: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        compression: CompressionType,
        compressor: impl AsRef<Path>,
    ) -> Self {
        let decompressor = match compression {
            CompressionType::None => None,
            _ => {
                let compressor = compressor.as_ref();
                let mut program = compressor.as_os_str().to_os_string();
                if compressor.file_name().is_some_and(|name| name == "pbzip2") {
                    program.push(" ");
                    program.push(PBZIP2_TRAILING_GARBAGE);
                }
                Some(program)
            }
        };

        Self {
            archive: archive.into(),
            dest: dest.into(),
            compression,
            decompressor,
        }
    }

    /// The `tar` command, run from inside `dest`
    pub fn command(&self) -> ToolCommand {
        let mut cmd = ToolCommand::new("tar");
        if let Some(ref program) = self.decompressor {
            cmd = cmd.arg("-I").arg(program);
        }
        cmd.arg("-xpf").arg(&self.archive).current_dir(&self.dest)
    }
}

/// Extract `archive` into `dest`, searching only `/` for decompressors
pub async fn untar(archive: &Path, dest: &Path) -> HoardResult<()> {
    untar_with(archive, dest, None).await
}

/// Extract `archive` into `dest`, searching the `[extract]` chroot from
/// `config` for decompressors
pub async fn untar_with_config(archive: &Path, dest: &Path, config: &Config) -> HoardResult<()> {
    untar_with(archive, dest, config.extract.chroot.as_deref()).await
}

/// Extract `archive` into `dest`, creating `dest` if needed.
///
/// Compression is detected from the archive's content. Decompressors are
/// looked up in `chroot` before `/`. A failed extraction may leave files
/// behind in `dest`.
pub async fn untar_with(archive: &Path, dest: &Path, chroot: Option<&Path>) -> HoardResult<()> {
    let archive = std::path::absolute(archive)
        .map_err(|e| HoardError::io(format!("resolving {}", archive.display()), e))?;
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| HoardError::io(format!("creating {}", dest.display()), e))?;

    let compression = CompressionType::detect(&archive).await?;
    let compressor = find_compressor(compression, chroot);
    let plan = ExtractPlan::new(&archive, dest, compression, &compressor);

    info!(
        "Extracting {} ({}) into {}",
        archive.display(),
        compression,
        dest.display()
    );
    plan.command().run().await?;
    Ok(())
}
