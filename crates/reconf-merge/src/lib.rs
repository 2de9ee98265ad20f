//! Reconf Merge & Render
//!
//! Turns a base template plus user overrides into a sealed, content-addressed
//! file set.
//!
//! # Core Concepts
//!
//! - [`ConfigTemplate`]: default files, constraints and reload policy
//! - [`TemplateRenderer`]: pluggable rendering ([`PassthroughRenderer`] by default)
//! - [`FormatRegistry`]: file extension to [`FileFormat`](reconf_artifact::FileFormat)
//! - [`MergePipeline`]: content replacement, ordered key edits, constraint checks
//!
//! # Example
//!
//! ```rust,ignore
//! use reconf_merge::{MergePipeline, MergeRequest, RenderContext};
//!
//! let pipeline = MergePipeline::default();
//! let outcome = pipeline.merge(&MergeRequest { template: &template, overrides: &overrides, context: &ctx })?;
//! println!("revision {}", outcome.rendered.revision());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod error;
mod pipeline;
mod registry;
mod renderer;
mod template;

pub use error::MergeError;
pub use pipeline::{DroppedParam, MergeOutcome, MergePipeline, MergeRequest};
pub use registry::FormatRegistry;
pub use renderer::{PassthroughRenderer, RenderContext, TemplateRenderer};
pub use template::{ConfigTemplate, ReloadPolicy, TemplateFile, TemplateRef};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use reconf_artifact::{ConfigParams, ItemName};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Replaces `{{component}}` with the component name
    #[derive(Debug)]
    struct ComponentRenderer;

    impl TemplateRenderer for ComponentRenderer {
        fn render(
            &self,
            template: &ConfigTemplate,
            context: &RenderContext,
        ) -> Result<BTreeMap<String, String>, MergeError> {
            Ok(template
                .files
                .iter()
                .map(|(n, f)| (n.clone(), f.content.replace("{{component}}", &context.component)))
                .collect())
        }

        fn name(&self) -> &'static str {
            "component"
        }
    }

    #[derive(Debug)]
    struct FailingRenderer;

    impl TemplateRenderer for FailingRenderer {
        fn render(
            &self,
            _template: &ConfigTemplate,
            _context: &RenderContext,
        ) -> Result<BTreeMap<String, String>, MergeError> {
            Err(MergeError::Render {
                renderer: self.name(),
                message: "boom".into(),
            })
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn template() -> ConfigTemplate {
        ConfigTemplate::new(ReloadPolicy::Http)
            .with_file("app.yaml", TemplateFile::new("name: '{{component}}'\nreplicas: 1\n"))
    }

    #[test]
    fn custom_renderer_output_is_merged() {
        let template = template();
        let overrides = BTreeMap::from([(
            "app.yaml".to_string(),
            ConfigParams::new().set("replicas", "3"),
        )]);
        let ctx = RenderContext::new(ItemName::new("app").unwrap(), "web");
        let out = MergePipeline::new(Arc::new(ComponentRenderer))
            .merge(&MergeRequest {
                template: &template,
                overrides: &overrides,
                context: &ctx,
            })
            .unwrap();
        assert_eq!(out.rendered.content("app.yaml"), Some("name: web\nreplicas: 3\n"));
    }

    #[test]
    fn renderer_failure_propagates() {
        let template = template();
        let ctx = RenderContext::new(ItemName::new("app").unwrap(), "web");
        let err = MergePipeline::new(Arc::new(FailingRenderer))
            .merge(&MergeRequest {
                template: &template,
                overrides: &BTreeMap::new(),
                context: &ctx,
            })
            .unwrap_err();
        assert!(matches!(err, MergeError::Render { renderer: "failing", .. }));
    }
}
