//! Collaborator traits for templates and instances
//!
//! The engine never stores templates or discovers replicas itself. Both are
//! looked up on demand so every merge sees the current template and every
//! rollout attempt sees the current instance set.

use async_trait::async_trait;
use reconf_merge::{ConfigTemplate, TemplateRef};

use crate::error::ProviderError;
use crate::types::Instance;

/// Resolves template references
#[async_trait]
pub trait TemplateStore: Send + Sync + std::fmt::Debug {
    /// Look up a template by reference
    ///
    /// # Errors
    /// [`ProviderError::TemplateNotFound`] if `template` is unknown, or
    /// [`ProviderError::Unavailable`] if the backing store failed
    async fn resolve_template(&self, template: &TemplateRef) -> Result<ConfigTemplate, ProviderError>;
}

/// Lists the live replicas of a component
#[async_trait]
pub trait InstanceProvider: Send + Sync + std::fmt::Debug {
    /// Current instance set; may differ between calls
    ///
    /// # Errors
    /// [`ProviderError::Unavailable`] if the set cannot be listed
    async fn current_instances(&self, component: &str) -> Result<Vec<Instance>, ProviderError>;
}
