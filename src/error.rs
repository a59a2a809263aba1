//! Error handling for the cleanup service
//!
//! Everything except a broken home directory, bad configuration or a
//! lifecycle violation is best-effort: it is logged, reported, and the build
//! carries on.

use crate::lifecycle::Phase;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Registry-specific errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry file {path} is inaccessible: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to lock registry {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Main error type for the cleanup service
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A termination attempt failed; never fatal
    #[error("failed to terminate pid {pid}: {message}")]
    ProcessControl { pid: u32, message: String },

    /// A cache entry is locked or in use; skipped
    #[error("cache entry {path} could not be removed: {source}")]
    StaleCacheAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The home directory is missing, unwritable or not a directory
    #[error("home directory {path} is unusable: {message}")]
    HomeDirectory { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid lifecycle transition from {from:?} to {to:?}")]
    Lifecycle { from: Phase, to: Phase },
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Registry,
    Process,
    Cache,
    Filesystem,
    Config,
    Lifecycle,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Registry => "Registry",
            ErrorCategory::Process => "Process",
            ErrorCategory::Cache => "Cache",
            ErrorCategory::Filesystem => "Filesystem",
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Lifecycle => "Lifecycle",
        }
    }
}

impl CleanupError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CleanupError::Registry(_) => ErrorCategory::Registry,
            CleanupError::ProcessControl { .. } => ErrorCategory::Process,
            CleanupError::StaleCacheAccess { .. } => ErrorCategory::Cache,
            CleanupError::HomeDirectory { .. } => ErrorCategory::Filesystem,
            CleanupError::Config(_) => ErrorCategory::Config,
            CleanupError::Lifecycle { .. } => ErrorCategory::Lifecycle,
        }
    }

    /// Whether the error should stop the build rather than be logged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CleanupError::HomeDirectory { .. }
                | CleanupError::Config(_)
                | CleanupError::Lifecycle { .. }
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            CleanupError::HomeDirectory { path, message } => format!(
                "{} error: {} ({}). Check that the directory exists and is writable.",
                self.category().display_name(),
                message,
                path.display()
            ),
            other => format!("{} error: {}", other.category().display_name(), other),
        }
    }
}

impl From<config::ConfigError> for CleanupError {
    fn from(err: config::ConfigError) -> Self {
        CleanupError::Config(err.to_string())
    }
}

pub type CleanupResult<T> = Result<T, CleanupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_startup_errors_are_fatal() {
        let home = CleanupError::HomeDirectory {
            path: PathBuf::from("/nope"),
            message: "does not exist".to_string(),
        };
        assert!(home.is_fatal());
        assert_eq!(home.category(), ErrorCategory::Filesystem);
        assert!(home.user_message().contains("/nope"));

        let kill = CleanupError::ProcessControl {
            pid: 42,
            message: "operation not permitted".to_string(),
        };
        assert!(!kill.is_fatal());
        assert_eq!(kill.category(), ErrorCategory::Process);

        let cache = CleanupError::StaleCacheAccess {
            path: PathBuf::from("/home/caches/5.0"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "locked"),
        };
        assert!(!cache.is_fatal());
        assert!(cache.user_message().starts_with("Cache error"));
    }

    #[test]
    fn registry_errors_keep_their_path() {
        let err: CleanupError =
            RegistryError::io("/g/registry.jsonl", io::Error::other("disk full")).into();
        assert!(err.to_string().contains("/g/registry.jsonl"));
        assert!(!err.is_fatal());
    }
}
