//! Error taxonomy for scripting machine operations.

use ember_domain::{Value, ValueError};
use thiserror::Error;

/// Error from a scripting machine operation.
///
/// `Runtime` carries the engine-side error *value* (not just its string
/// form) and a level controlling source-location prefixing, mirroring the
/// engine's own `error(value, level)` convention.
#[derive(Error, Debug, Clone)]
pub enum ScriptError {
    #[error("script error: {value}")]
    Runtime { value: Value, level: u32 },

    #[error("compile error: {0}")]
    Compile(String),

    #[error("script timeout{}", if *.fatal { " (fatal)" } else { "" })]
    Timeout { fatal: bool },

    #[error("script memory ceiling exhausted")]
    OutOfMemory,

    #[error("host error inside engine callback: {0}")]
    Host(String),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("handle {0} refers to a released engine value")]
    StaleHandle(u64),

    #[error("handle belongs to a different machine")]
    ForeignHandle,

    #[error("machine has been disposed")]
    Disposed,

    #[error("engine failure: {0}")]
    Engine(String),
}

impl ScriptError {
    /// Runtime error with the default level (1: blame the caller).
    pub fn runtime(value: Value) -> Self {
        ScriptError::Runtime { value, level: 1 }
    }

    pub fn runtime_msg(message: impl Into<String>) -> Self {
        ScriptError::runtime(Value::Str(message.into()))
    }

    /// Whether this error leaves the current top-level call unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScriptError::Timeout { fatal: true } | ScriptError::Disposed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_display_shows_payload() {
        let error = ScriptError::runtime(Value::Str("bad input".into()));
        assert_eq!(error.to_string(), "script error: bad input");
    }

    #[test]
    fn test_timeout_display_marks_fatal_stage() {
        assert_eq!(
            ScriptError::Timeout { fatal: false }.to_string(),
            "script timeout"
        );
        assert_eq!(
            ScriptError::Timeout { fatal: true }.to_string(),
            "script timeout (fatal)"
        );
    }

    #[test]
    fn test_value_error_converts() {
        let err: ScriptError = ValueError::NilKey.into();
        assert_eq!(err.to_string(), "table key cannot be nil");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ScriptError::Timeout { fatal: true }.is_fatal());
        assert!(!ScriptError::Timeout { fatal: false }.is_fatal());
        assert!(!ScriptError::OutOfMemory.is_fatal());
    }
}
