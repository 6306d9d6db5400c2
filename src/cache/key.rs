//! Cache keys and their on-disk names
//!
//! A key is an ordered tuple of strings. Each component is percent-encoded
//! so it cannot contain a path separator, the `+` joiner, or a leading dot;
//! the encoded components are then joined with `+`. The mapping is
//! injective, so it can be reversed when enumerating a cache root.

use crate::error::{HoardError, HoardResult};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;

/// Longest file name most filesystems accept
const NAME_MAX: usize = 255;

/// Appended to an encoded name to form its lock file's name
pub(crate) const LOCK_SUFFIX: &str = ".lock";

/// Longest encoded name that still leaves room for the lock suffix
const MAX_ENCODED_LEN: usize = NAME_MAX - LOCK_SUFFIX.len();

/// Bytes escaped in a component; `+` and `/` are always escaped
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b',')
    .remove(b'=')
    .remove(b'@')
    .remove(b'~')
    .remove(b':');

/// Joins encoded components in an entry's file name
const SEPARATOR: &str = "+";

/// An ordered tuple of path-safe components identifying one cache slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    components: Vec<String>,
    file_name: String,
}

impl CacheKey {
    /// Build a key from its components.
    ///
    /// Fails if there are no components, a component is empty, or the
    /// encoded name would not fit in a single file name.
    pub fn new<I, S>(components: I) -> HoardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        let invalid = |reason: &str| HoardError::InvalidKey {
            key: format!("{:?}", components),
            reason: reason.to_string(),
        };

        if components.is_empty() {
            return Err(invalid("a key needs at least one component"));
        }
        if components.iter().any(String::is_empty) {
            return Err(invalid("key components must not be empty"));
        }

        let file_name = components
            .iter()
            .map(|c| encode_component(c))
            .collect::<Vec<_>>()
            .join(SEPARATOR);

        if file_name.len() > MAX_ENCODED_LEN {
            return Err(invalid(&format!(
                "encoded name is {} bytes, limit is {}",
                file_name.len(),
                MAX_ENCODED_LEN
            )));
        }

        Ok(Self {
            components,
            file_name,
        })
    }

    /// Recover a key from an entry's file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        let components = name
            .split(SEPARATOR)
            .map(decode_component)
            .collect::<Option<Vec<_>>>()?;
        let key = Self::new(components).ok()?;
        // Only canonical encodings are keys; anything else was not written by us.
        (key.file_name == name).then_some(key)
    }

    /// The key's components, in order
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The encoded file name used for the entry and its lock
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.components.join(", "))
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = HoardError;

    fn try_from(component: &str) -> HoardResult<Self> {
        Self::new([component])
    }
}

impl<const N: usize> TryFrom<[&str; N]> for CacheKey {
    type Error = HoardError;

    fn try_from(components: [&str; N]) -> HoardResult<Self> {
        Self::new(components)
    }
}

fn encode_component(component: &str) -> String {
    let encoded = utf8_percent_encode(component, COMPONENT).to_string();
    // A leading dot would make "." and ".." or hidden names.
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded,
    }
}

fn decode_component(encoded: &str) -> Option<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}
