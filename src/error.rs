//! Error types shared across the engine.

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while compiling or running scripts, segments and templates.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    /// End of an iterable feed. Not a failure.
    #[error("EOF")]
    Eof,

    #[error("compile error: {reason} in `{fragment}`")]
    Compile { fragment: String, reason: String },

    #[error("{0}")]
    Runtime(String),

    #[error("mismatch at {path}: expected {expected}, got {actual}")]
    Mismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl ScriptError {
    pub fn compile(fragment: impl Into<String>, reason: impl Into<String>) -> Self {
        ScriptError::Compile {
            fragment: fragment.into(),
            reason: reason.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime(message.into())
    }

    pub fn mismatch(
        path: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        ScriptError::Mismatch {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ScriptError::Eof)
    }
}

/// Errors raised while loading and compiling a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to read `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse `{}`: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("failed schedules: {}", .0.join(", "))]
    Failed(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_recognised() {
        assert!(ScriptError::Eof.is_eof());
        assert!(!ScriptError::runtime("boom").is_eof());
    }

    #[test]
    fn failed_lists_schedule_names() {
        let err = EngineError::Failed(vec!["login".into(), "search".into()]);
        assert_eq!(err.to_string(), "failed schedules: login, search");
    }

    #[test]
    fn mismatch_names_path() {
        let err = ScriptError::mismatch("$.int", "11", "12");
        assert_eq!(err.to_string(), "mismatch at $.int: expected 11, got 12");
    }
}
