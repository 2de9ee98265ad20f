//! Merge errors

use reconf_artifact::{ConstraintError, DocumentError, ParamError};

/// Errors raised while rendering or merging an item
///
/// Every variant means the inputs are wrong; retrying the same inputs
/// gives the same error.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Renderer failure
    #[error("render failed ({renderer}): {message}")]
    Render {
        /// Renderer name
        renderer: &'static str,
        /// Renderer message
        message: String,
    },

    /// Bad override
    #[error(transparent)]
    Param(#[from] ParamError),

    /// File could not be parsed or edited
    #[error("file '{file}': {source}")]
    Document {
        /// File name
        file: String,
        /// Parse or edit error
        #[source]
        source: DocumentError,
    },

    /// Merged file breaks a template constraint
    #[error("file '{file}': constraint violation: {source}")]
    Constraint {
        /// File name
        file: String,
        /// Every broken rule
        #[source]
        source: ConstraintError,
    },
}

impl MergeError {
    /// File the error refers to, if any
    #[must_use]
    pub fn file(&self) -> Option<&str> {
        match self {
            Self::Document { file, .. } | Self::Constraint { file, .. } => Some(file),
            Self::Param(ParamError::UnknownFile(file)) => Some(file),
            Self::Render { .. } | Self::Param(_) => None,
        }
    }
}
