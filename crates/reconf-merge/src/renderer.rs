//! Template renderer trait
//!
//! Rendering turns a template's default files into concrete text for one
//! item. The templating language is pluggable; [`PassthroughRenderer`]
//! uses the default content unchanged.

use std::collections::BTreeMap;

use reconf_artifact::ItemName;

use crate::error::MergeError;
use crate::template::ConfigTemplate;

/// Values available to a renderer
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenderContext {
    /// Item being rendered
    pub item: ItemName,
    /// Owning component
    pub component: String,
    /// Opaque trigger marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// Extra values supplied by the caller
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl RenderContext {
    /// Context for `item` of `component`
    #[must_use]
    pub fn new(item: ItemName, component: impl Into<String>) -> Self {
        Self {
            item,
            component: component.into(),
            marker: None,
            values: BTreeMap::new(),
        }
    }

    /// Set the trigger marker
    #[must_use]
    pub fn with_marker(mut self, marker: Option<String>) -> Self {
        self.marker = marker;
        self
    }

    /// Add an extra value
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

/// Renders template files for one item
///
/// Implementations must be deterministic: equal template and context give
/// equal output, otherwise revisions are unstable.
pub trait TemplateRenderer: Send + Sync + std::fmt::Debug {
    /// Render every file of `template`
    ///
    /// # Errors
    /// Returns [`MergeError::Render`] if the template cannot be rendered
    fn render(
        &self,
        template: &ConfigTemplate,
        context: &RenderContext,
    ) -> Result<BTreeMap<String, String>, MergeError>;

    /// Renderer name (for logging)
    fn name(&self) -> &'static str;
}

/// Uses template content verbatim
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer;

impl PassthroughRenderer {
    /// Create new passthrough renderer
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TemplateRenderer for PassthroughRenderer {
    fn render(
        &self,
        template: &ConfigTemplate,
        _context: &RenderContext,
    ) -> Result<BTreeMap<String, String>, MergeError> {
        Ok(template
            .files
            .iter()
            .map(|(name, file)| (name.clone(), file.content.clone()))
            .collect())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ReloadPolicy, TemplateFile};

    #[test]
    fn passthrough_keeps_content() {
        let template = ConfigTemplate::new(ReloadPolicy::Signal)
            .with_file("a.conf", TemplateFile::new("x=1\n"))
            .with_file("b.json", TemplateFile::new("{}"));
        let ctx = RenderContext::new(ItemName::new("item").unwrap(), "mysql");
        let files = PassthroughRenderer::new().render(&template, &ctx).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["a.conf"], "x=1\n");
    }
}
