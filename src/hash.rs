//! Streaming content hashing for integrity checks

use crate::error::{HoardError, HoardResult};
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// SHA-1 of the file at `path` as lowercase hex.
///
/// The file is read in fixed-size chunks, so arbitrarily large files hash in
/// constant memory.
pub async fn sha1_file(path: &Path) -> HoardResult<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| HoardError::io(format!("opening {} for hashing", path.display()), e))?;

    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| HoardError::io(format!("reading {} for hashing", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
