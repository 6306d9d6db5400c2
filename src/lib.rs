//! Hoard - shared artifact cache for build tooling
//!
//! Stores build artifacts under deterministic keys in a cache root that
//! many processes may use at once. Each key is guarded by an advisory file
//! lock, entries are published atomically, and stale entries are swept by
//! age. Remote sources are fetched over `file`, `http(s)`, `ftp` and `gs`.

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod process;

pub use cache::{
    Cache, CacheGuard, CacheKey, CacheReference, DiskCache, FetchOptions, RemoteCache,
    RemoteFetch, TarballCache,
};
pub use error::{HoardError, HoardResult};
