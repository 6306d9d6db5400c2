//! Compression detection and decompressor lookup

use crate::error::{HoardError, HoardResult};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::AsyncReadExt;

/// Compression applied to an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

const MAGIC: &[(&[u8], CompressionType)] = &[
    (b"BZh" as &[u8], CompressionType::Bzip2),
    (b"\x1f\x8b" as &[u8], CompressionType::Gzip),
    (b"\xfd\x37\x7a\x58\x5a\x00" as &[u8], CompressionType::Xz),
    (b"\x28\xb5\x2f\xfd" as &[u8], CompressionType::Zstd),
];

impl CompressionType {
    /// Sniff the compression of the file at `path` from its leading bytes
    pub async fn detect(path: &Path) -> HoardResult<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| HoardError::io(format!("opening {}", path.display()), e))?;
        let mut head = Vec::with_capacity(6);
        file.take(6)
            .read_to_end(&mut head)
            .await
            .map_err(|e| HoardError::io(format!("reading {}", path.display()), e))?;
        Ok(Self::from_magic(&head))
    }

    /// Compression indicated by the leading bytes of a stream
    pub fn from_magic(head: &[u8]) -> Self {
        MAGIC
            .iter()
            .find(|(magic, _)| head.starts_with(magic))
            .map_or(Self::None, |(_, kind)| *kind)
    }

    /// Compression suggested by a file name; unknown extensions are `None`
    pub fn from_extension(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("tgz" | "gz") => Self::Gzip,
            Some("tbz2" | "bz2") => Self::Bzip2,
            Some("txz" | "xz") => Self::Xz,
            Some("zst") => Self::Zstd,
            _ => Self::None,
        }
    }

    /// Decompressor programs, most preferred first
    pub fn programs(&self) -> &'static [&'static str] {
        match self {
            Self::None => &["cat"],
            Self::Gzip => &["pigz", "gzip"],
            Self::Bzip2 => &["lbzip2", "pbzip2", "bzip2"],
            Self::Xz => &["pixz", "xz"],
            Self::Zstd => &["zstdmt", "zstd"],
        }
    }
}

impl FromStr for CompressionType {
    type Err = HoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::None),
            "gz" => Ok(Self::Gzip),
            "bz2" => Ok(Self::Bzip2),
            "xz" => Ok(Self::Xz),
            "zst" => Ok(Self::Zstd),
            other => Err(HoardError::UnknownCompression(other.to_string())),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
            Self::Bzip2 => write!(f, "bzip2"),
            Self::Xz => write!(f, "xz"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

/// Locate a decompressor for `kind`, preferring parallel implementations
/// and a copy inside `chroot` over one in `/`.
///
/// Falls back to the bare name of the last candidate for `PATH` lookup.
pub fn find_compressor(kind: CompressionType, chroot: Option<&Path>) -> PathBuf {
    if kind == CompressionType::None {
        return PathBuf::from("cat");
    }
    let root = Path::new("/");
    match chroot {
        Some(chroot) => find_compressor_in(kind, &[chroot, root]),
        None => find_compressor_in(kind, &[root]),
    }
}

pub(crate) fn find_compressor_in(kind: CompressionType, roots: &[&Path]) -> PathBuf {
    let programs = kind.programs();
    for program in programs {
        for root in roots {
            for bin in ["bin", "usr/bin"] {
                let candidate = root.join(bin).join(program);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
    }
    PathBuf::from(programs[programs.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn magic_detection() {
        assert_eq!(CompressionType::from_magic(b"BZh91AY"), CompressionType::Bzip2);
        assert_eq!(CompressionType::from_magic(b"\x1f\x8b\x08\x00"), CompressionType::Gzip);
        assert_eq!(
            CompressionType::from_magic(b"\xfd7zXZ\x00\x00"),
            CompressionType::Xz
        );
        assert_eq!(
            CompressionType::from_magic(b"\x28\xb5\x2f\xfd\x04"),
            CompressionType::Zstd
        );
        assert_eq!(CompressionType::from_magic(b"ustar"), CompressionType::None);
        assert_eq!(CompressionType::from_magic(b""), CompressionType::None);
        assert_eq!(CompressionType::from_magic(b"\x1f"), CompressionType::None);
    }

    #[tokio::test]
    async fn detect_reads_content_not_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("misnamed.tar.gz");
        std::fs::write(&path, b"BZh9 rest of stream").unwrap();
        assert_eq!(
            CompressionType::detect(&path).await.unwrap(),
            CompressionType::Bzip2
        );

        let short = dir.path().join("short");
        std::fs::write(&short, b"x").unwrap();
        assert_eq!(
            CompressionType::detect(&short).await.unwrap(),
            CompressionType::None
        );
    }

    #[test]
    fn extensions() {
        let cases = [
            ("a.tgz", CompressionType::Gzip),
            ("a.tar.gz", CompressionType::Gzip),
            ("a.tbz2", CompressionType::Bzip2),
            ("a.tar.bz2", CompressionType::Bzip2),
            ("a.txz", CompressionType::Xz),
            ("a.tar.xz", CompressionType::Xz),
            ("a.tar.zst", CompressionType::Zstd),
            ("a.tar", CompressionType::None),
            ("noext", CompressionType::None),
        ];
        for (name, expected) in cases {
            assert_eq!(CompressionType::from_extension(Path::new(name)), expected, "{name}");
        }
    }

    #[test]
    fn parse_names() {
        assert_eq!("gz".parse::<CompressionType>().unwrap(), CompressionType::Gzip);
        assert_eq!("zst".parse::<CompressionType>().unwrap(), CompressionType::Zstd);
        assert_eq!("".parse::<CompressionType>().unwrap(), CompressionType::None);
        assert!(matches!(
            "lzma".parse::<CompressionType>(),
            Err(HoardError::UnknownCompression(_))
        ));
    }

    #[test]
    fn none_is_cat() {
        assert_eq!(find_compressor(CompressionType::None, None), PathBuf::from("cat"));
    }

    #[test]
    fn chroot_copy_preferred() {
        let chroot = TempDir::new().unwrap();
        let empty = TempDir::new().unwrap();
        std::fs::create_dir_all(chroot.path().join("usr/bin")).unwrap();
        std::fs::write(chroot.path().join("usr/bin/zstdmt"), "").unwrap();

        assert_eq!(
            find_compressor_in(CompressionType::Zstd, &[chroot.path(), empty.path()]),
            chroot.path().join("usr/bin/zstdmt")
        );
    }

    #[test]
    fn parallel_program_preferred() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("bin")).unwrap();
        std::fs::write(root.path().join("bin/bzip2"), "").unwrap();
        std::fs::write(root.path().join("bin/pbzip2"), "").unwrap();

        assert_eq!(
            find_compressor_in(CompressionType::Bzip2, &[root.path()]),
            root.path().join("bin/pbzip2")
        );
    }

    #[test]
    fn falls_back_to_bare_name() {
        let empty = TempDir::new().unwrap();
        assert_eq!(
            find_compressor_in(CompressionType::Xz, &[empty.path()]),
            PathBuf::from("xz")
        );
        assert_eq!(
            find_compressor_in(CompressionType::Gzip, &[empty.path()]),
            PathBuf::from("gzip")
        );
    }
}
