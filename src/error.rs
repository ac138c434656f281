//! Pipeline error types.

use thiserror::Error;

/// Result type for pipeline operations.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Errors that can occur while compiling, verifying, or loading plugins.
///
/// Every variant carries enough context to produce a single human-readable
/// diagnostic attributable to one plugin name. Unit-level variants fail only
/// the named unit; [`ForgeError::Infrastructure`] fails every unit in the
/// affected batch.
#[derive(Debug, Clone, Error)]
pub enum ForgeError {
    /// Source file missing, unreadable, empty, or locked past the retry budget.
    #[error("Source error in plugin '{unit}': {reason}")]
    Source { unit: String, reason: String },

    /// A required plugin or referenced library could not be resolved.
    #[error("Dependency error in plugin '{unit}': {reason}")]
    Dependency { unit: String, reason: String },

    /// Compiler-reported syntax or semantic error attributed to a unit.
    #[error("Compile error in plugin '{unit}': {message}")]
    Compile { unit: String, message: String },

    /// The verifier rejected or patched a disallowed API use.
    #[error("Security violation in plugin '{unit}': use of '{symbol}' is not permitted")]
    Security { unit: String, symbol: String },

    /// Wrong entry type name or no usable default constructor.
    #[error("Structural error in plugin '{unit}': {reason}")]
    Structural { unit: String, reason: String },

    /// Compiler worker crash, timeout, or disconnect.
    #[error("Compiler infrastructure failure: {0}")]
    Infrastructure(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plugin name not known to the unit registry.
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    /// Watcher setup or delivery failure.
    #[error("Watch error: {0}")]
    Watch(String),

    /// IO error outside the retried source-read paths.
    #[error("IO error: {0}")]
    Io(String),
}

impl ForgeError {
    /// The plugin name this error is attributable to, if any.
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::Source { unit, .. }
            | Self::Dependency { unit, .. }
            | Self::Compile { unit, .. }
            | Self::Security { unit, .. }
            | Self::Structural { unit, .. } => Some(unit),
            Self::UnknownPlugin(name) => Some(name),
            _ => None,
        }
    }

    /// Whether this error fails the whole batch rather than a single unit.
    pub fn is_batch_level(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_attribution() {
        let err = ForgeError::Compile { unit: "Shop".to_string(), message: "bad token".to_string() };
        assert_eq!(err.unit(), Some("Shop"));

        let err = ForgeError::Infrastructure("worker died".to_string());
        assert_eq!(err.unit(), None);
        assert!(err.is_batch_level());
    }

    #[test]
    fn test_display_names_one_plugin() {
        let err = ForgeError::Dependency {
            unit: "Shop".to_string(),
            reason: "missing dependencies: Core".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("Shop"));
        assert!(text.contains("Core"));
    }
}
