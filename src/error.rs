//! Error taxonomy shared by every bionet component.
//!
//! Every variant is fatal to the run that raised it. The one recoverable
//! condition (an image-statistics cache miss) is logged, not returned.

use thiserror::Error;

/// Library result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Mathematically invalid parameters (non-positive scale, surround not
    /// larger than centre, bandwidth outside its domain).
    #[error("domain error: {0}")]
    Domain(String),

    /// A tensor or layer was presented with incompatible dimensions.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// No layer / record / entry satisfied a lookup.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two independently computed accuracy figures disagreed.
    #[error(
        "reconciliation failed for {context}: {left_label}={left:.6} vs {right_label}={right:.6} (tolerance {tolerance:.6})"
    )]
    Reconciliation {
        context: String,
        left_label: &'static str,
        left: f64,
        right_label: &'static str,
        right: f64,
        tolerance: f64,
    },

    /// Unknown names in configuration (optimizer, colour mode, layer tag...).
    #[error("config error: {0}")]
    Config(String),

    /// A recognised but unsupported or out-of-range value.
    #[error("invalid value: {0}")]
    Value(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

impl Error {
    pub(crate) fn shape(
        what: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Error::ShapeMismatch {
            what: what.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_message() {
        let err = Error::shape("kernel tensor", (63, 63, 1, 24), (63, 63, 1, 23));
        let msg = err.to_string();
        assert!(msg.contains("(63, 63, 1, 24)"));
        assert!(msg.contains("(63, 63, 1, 23)"));
    }

    #[test]
    fn test_json_error_converts() {
        let parsed: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
