//! Archive extraction
//!
//! Entries of a `TarballCache` are plain archives; consumers unpack them
//! with `untar` after looking them up.

pub mod compression;
pub mod untar;

pub use compression::{find_compressor, CompressionType};
pub use untar::{untar, untar_with, untar_with_config, ExtractPlan};
