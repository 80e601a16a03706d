//! Plugin error types.

use thiserror::Error;

/// Errors raised while resolving, loading, or running plugins.
///
/// All of these are scoped to a single plugin; none is fatal to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    /// The identifier does not match any registered plugin.
    #[error("unknown plugin: '{identifier}'")]
    Unknown { identifier: String },

    /// The identifier resolved, but to a plugin of the other kind.
    #[error("plugin '{identifier}' is a {actual} plugin, not a {expected} plugin")]
    WrongKind {
        identifier: String,
        expected: String,
        actual: String,
    },

    /// Construction or `load` failed.
    #[error("failed to load plugin '{plugin}': {reason}")]
    Load { plugin: String, reason: String },

    /// A plugin hook returned an error or panicked.
    #[error("plugin '{plugin}' failed: {reason}")]
    Execution { plugin: String, reason: String },
}

impl PluginError {
    pub fn load(plugin: &str, reason: impl Into<String>) -> Self {
        Self::Load {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }

    pub fn execution(plugin: &str, reason: impl Into<String>) -> Self {
        Self::Execution {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            PluginError::Unknown {
                identifier: "lasso".into()
            }
            .to_string(),
            "unknown plugin: 'lasso'"
        );
        assert_eq!(
            PluginError::load("basic", "bad regex").to_string(),
            "failed to load plugin 'basic': bad regex"
        );
    }
}
