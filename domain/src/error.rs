//! Domain error types

use thiserror::Error;

/// Errors raised by the value model itself, independent of any engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("index {index} out of range for array length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("table key cannot be nil")]
    NilKey,

    #[error("table key cannot be NaN")]
    NanKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_display() {
        let error = ValueError::TypeMismatch {
            expected: "integer",
            actual: "string",
        };
        assert_eq!(error.to_string(), "type mismatch: expected integer, got string");
    }

    #[test]
    fn test_index_out_of_range_display() {
        let error = ValueError::IndexOutOfRange { index: 5, len: 3 };
        assert_eq!(error.to_string(), "index 5 out of range for array length 3");
    }
}
