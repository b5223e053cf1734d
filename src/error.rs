//! Error types for model construction, training and inference.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ModelError {
    /// Two tensors or configuration values disagree on a dimension.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A character or tag value has no id in its vocabulary.
    #[error("missing vocabulary entry: {0}")]
    MissingVocabEntry(String),

    /// A batch row holds nothing but padding.
    #[error("degenerate batch: {0}")]
    DegenerateBatch(String),

    /// Loss became NaN or infinite.
    #[error("non-finite {what}: {value}")]
    NonFiniteLoss { what: &'static str, value: f32 },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed corpus line.
    #[error("corpus error at {path}:{line}: {message}")]
    Corpus {
        path: String,
        line: usize,
        message: String,
    },

    /// Saving or loading a checkpoint failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Shorthand for [`ModelError::ShapeMismatch`].
    pub fn shape(context: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            context,
            expected,
            actual,
        }
    }
}

/// Result alias used throughout the crate. The error parameter stays open
/// so derive macros that name `Result<T, E>` still resolve.
pub type Result<T, E = ModelError> = std::result::Result<T, E>;

/// Fail with [`ModelError::NonFiniteLoss`] unless `value` is finite.
pub fn ensure_finite(what: &'static str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ModelError::NonFiniteLoss { what, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_finite_rejects_nan_and_inf() {
        assert!(ensure_finite("loss", 1.5).is_ok());
        assert!(matches!(
            ensure_finite("loss", f32::NAN),
            Err(ModelError::NonFiniteLoss { what: "loss", .. })
        ));
        assert!(ensure_finite("loss", f32::INFINITY).is_err());
    }

    #[test]
    fn result_alias_accepts_foreign_errors() {
        let parsed: Result<u8, std::num::ParseIntError> = "7".parse();
        assert_eq!(parsed.ok(), Some(7));
        let own: Result<()> = Err(ModelError::Config("bad".into()));
        assert!(own.is_err());
    }

    #[test]
    fn shape_mismatch_message_names_context() {
        let err = ModelError::shape("decoder input", 64, 60);
        assert_eq!(
            err.to_string(),
            "shape mismatch in decoder input: expected 64, got 60"
        );
    }
}
