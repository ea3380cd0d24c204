use thiserror::Error;


#[derive(Debug, Clone, PartialEq, Error)]
pub enum DepthConvError {
    #[error("{what} shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String,
    },

    #[error("backward called without a saved forward context")]
    MissingContext,
}

impl DepthConvError {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}
