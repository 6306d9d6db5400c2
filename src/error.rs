//! Error types for Hoard
//!
//! All modules use `HoardResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Hoard operations
pub type HoardResult<T> = Result<T, HoardError>;

/// All errors that can occur in Hoard
#[derive(Error, Debug)]
pub enum HoardError {
    // Cache integrity errors
    #[error("SHA-1 mismatch for {origin}: expected {expected}, got {actual}")]
    HashMismatch {
        origin: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported scheme '{scheme}' in {uri}")]
    UnsupportedScheme { uri: String, scheme: String },

    // Input errors
    #[error("Invalid cache key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Unknown compression type: {0}")]
    UnknownCompression(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, exit code: {}, stderr: {stderr}", exit_code_label(.code))]
    CommandExecution {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    // Serialization errors
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

impl HoardError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(
        command: impl Into<String>,
        code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandExecution {
            command: command.into(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Whether this is one of the cache's own deliberate failures
    /// (integrity mismatch or unsupported remote scheme)
    pub fn is_cache_error(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. } | Self::UnsupportedScheme { .. }
        )
    }

    /// The native I/O error kind, if this error wraps one
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io { source, .. }
            | Self::CommandFailed { source, .. }
            | Self::ConfigDirCreate { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandExecution { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::HashMismatch { .. } => {
                Some("The remote artifact changed or the expected digest is stale")
            }
            Self::UnsupportedScheme { .. } => {
                Some("Supported schemes: file, http, https, ftp, gs")
            }
            Self::CommandFailed { .. } => Some("Check that the tool is installed and on PATH"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = HoardError::UnsupportedScheme {
            uri: "s3://bucket/object".to_string(),
            scheme: "s3".to_string(),
        };
        assert!(err.to_string().contains("Unsupported scheme 's3'"));
    }

    #[test]
    fn command_exec_display_without_code() {
        let err = HoardError::command_exec("tar -xpf x", None, "killed");
        assert!(err.to_string().contains("exit code: signal"));
    }

    #[test]
    fn cache_error_class() {
        let mismatch = HoardError::HashMismatch {
            origin: "file:///tmp/a".to_string(),
            expected: "12345".to_string(),
            actual: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
        };
        assert!(mismatch.is_cache_error());
        assert!(!HoardError::Internal("x".to_string()).is_cache_error());
    }

    #[test]
    fn io_kind_preserved() {
        let err = HoardError::io(
            "copying",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::PermissionDenied));
        assert!(!err.is_cache_error());
    }

    #[test]
    fn error_hint() {
        let err = HoardError::UnsupportedScheme {
            uri: "s3://b/o".to_string(),
            scheme: "s3".to_string(),
        };
        assert_eq!(err.hint(), Some("Supported schemes: file, http, https, ftp, gs"));
    }
}
