//! Error types for the reconfiguration engine
//!
//! Provides [`ReconfError`], returned by the engine API, plus the errors of
//! the engine's collaborators:
//! - template and instance lookups ([`ProviderError`])
//! - per-instance reloads ([`ReloadError`])

use reconf_artifact::{NameError, RevisionError};
use reconf_merge::{MergeError, ReloadPolicy, TemplateRef};

use crate::config::ConfigError;
use crate::phase::TransitionError;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum ReconfError {
    /// No item with this name
    #[error("item not found: {0}")]
    NotFound(String),

    /// Attempt to change a field fixed at creation
    #[error("field '{field}' is immutable (was '{current}', got '{requested}')")]
    ImmutableField {
        field: &'static str,
        current: String,
        requested: String,
    },

    /// Invalid item name
    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    /// Merge or constraint failure
    #[error("constraint violation: {0}")]
    ConstraintViolation(#[from] MergeError),

    /// Some instances did not apply the revision
    #[error("partial rollout failure: {succeeded}/{expected} instances applied: {message}")]
    PartialRolloutFailure {
        succeeded: usize,
        expected: usize,
        message: String,
    },

    /// Rollout cannot proceed
    #[error("fatal rollout failure: {0}")]
    FatalRolloutFailure(String),

    /// Event not allowed in the current phase
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    /// Template reference did not resolve
    #[error("template not found: {0}")]
    TemplateNotFound(TemplateRef),

    /// Engine shut down or item worker gone
    #[error("engine closed")]
    EngineClosed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Collaborator failure
    #[error("provider error: {0}")]
    Provider(ProviderError),

    /// Fingerprint could not be computed
    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] RevisionError),
}

impl ReconfError {
    /// Check if the operation may succeed when repeated unchanged
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PartialRolloutFailure { .. } | Self::Provider(ProviderError::Unavailable(_))
        )
    }

    /// Check if a human must change inputs or resume
    #[inline]
    #[must_use]
    pub fn requires_intervention(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation(_) | Self::FatalRolloutFailure(_) | Self::TemplateNotFound(_)
        )
    }
}

impl From<ProviderError> for ReconfError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::TemplateNotFound(template) => Self::TemplateNotFound(template),
            other => Self::Provider(other),
        }
    }
}

/// Errors from template stores and instance providers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Template reference did not resolve
    #[error("template not found: {0}")]
    TemplateNotFound(TemplateRef),

    /// Backend unreachable or failing
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Errors from a reload executor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReloadError {
    /// This instance failed; retrying may help
    #[error("instance {instance}: {message}")]
    Failed { instance: String, message: String },

    /// Retrying will not help (bad payload, permission denied, ...)
    #[error("instance {instance}: fatal: {message}")]
    Fatal { instance: String, message: String },

    /// No executor registered for the policy
    #[error("no reload executor registered for policy '{0}'")]
    NoExecutor(ReloadPolicy),
}

impl ReloadError {
    /// Retryable per-instance failure
    pub fn failed(instance: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            instance: instance.into(),
            message: message.into(),
        }
    }

    /// Fatal failure
    pub fn fatal(instance: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            instance: instance.into(),
            message: message.into(),
        }
    }

    /// Whether the whole rollout must stop
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}
