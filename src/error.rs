//! Error taxonomy shared by strategies, the metadata store and the manager.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while acquiring or driving a plugin
#[derive(Debug, Error)]
pub enum PluginError {
    /// Bad URL or extension, missing or malformed manifest, missing `name`
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Path traversal or a size ceiling was hit while extracting
    #[error("Security violation: {0}")]
    Security(String),

    /// Fetch failure, non-2xx response, or timeout after retries
    #[error("Network error: {0}")]
    Network(String),

    /// mkdir/rename/rm failure
    #[error("Filesystem error at {path}: {message}")]
    FileSystem { path: PathBuf, message: String },

    /// A loaded module failed inside one of its lifecycle hooks
    #[error("Plugin '{plugin}' failed during {hook}: {message}")]
    Lifecycle {
        plugin: String,
        hook: String,
        message: String,
    },

    #[error("Metadata store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Unknown plugin source type: {0}")]
    UnknownSource(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),
}

impl PluginError {
    /// Build a filesystem error from an io error and the path involved
    pub fn fs(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn lifecycle(plugin: &str, hook: &str, message: impl Into<String>) -> Self {
        Self::Lifecycle {
            plugin: plugin.to_string(),
            hook: hook.to_string(),
            message: message.into(),
        }
    }

    /// Stable tag used in status events sent to the host
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Security(_) => "security",
            Self::Network(_) => "network",
            Self::FileSystem { .. } => "filesystem",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Storage(_) => "storage",
            Self::UnknownSource(_) => "unknown_source",
            Self::NotFound(_) => "not_found",
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for PluginError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_are_stable() {
        assert_eq!(PluginError::Validation("x".into()).category(), "validation");
        assert_eq!(PluginError::Security("x".into()).category(), "security");
        assert_eq!(PluginError::Network("x".into()).category(), "network");
        assert_eq!(
            PluginError::fs("/tmp/a", std::io::Error::other("boom")).category(),
            "filesystem"
        );
        assert_eq!(
            PluginError::lifecycle("p", "activate", "exit 1").category(),
            "lifecycle"
        );
        assert_eq!(PluginError::UnknownSource("GIT".into()).category(), "unknown_source");
    }

    #[test]
    fn test_json_errors_map_to_validation() {
        let err: PluginError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, PluginError::Validation(_)));
    }

    #[test]
    fn test_lifecycle_message_names_plugin_and_hook() {
        let err = PluginError::lifecycle("clock", "deactivate", "exit status 2");
        let msg = err.to_string();
        assert!(msg.contains("clock"));
        assert!(msg.contains("deactivate"));
    }
}
