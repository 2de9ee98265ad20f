//! Merge & render pipeline
//!
//! Combines a rendered template, per-file overrides and the trigger marker
//! into a sealed [`RenderedConfig`].
//!
//! # Order of application (per file)
//! 1. rendered template text
//! 2. override `content`, replacing the file
//! 3. override `parameters`, in lexical key order, minus immutable keys
//! 4. constraint validation of the result

use std::collections::BTreeMap;
use std::sync::Arc;

use reconf_artifact::{
    ConfigDocument, ConfigParams, DocumentError, ParamError, RenderedConfig, RenderedFile,
};

use crate::error::MergeError;
use crate::registry::FormatRegistry;
use crate::renderer::{PassthroughRenderer, RenderContext, TemplateRenderer};
use crate::template::ConfigTemplate;

/// Inputs of one merge
#[derive(Debug, Clone, Copy)]
pub struct MergeRequest<'a> {
    /// Resolved template (override ref already applied)
    pub template: &'a ConfigTemplate,
    /// Overrides, by file name
    pub overrides: &'a BTreeMap<String, ConfigParams>,
    /// Render context, including the trigger marker
    pub context: &'a RenderContext,
}

/// Override that was ignored because the key is immutable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedParam {
    /// File name
    pub file: String,
    /// Dotted key
    pub key: String,
}

/// Result of a successful merge
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Sealed file set
    pub rendered: RenderedConfig,
    /// Immutable overrides that were skipped
    pub dropped: Vec<DroppedParam>,
}

/// Deterministic merge of template and overrides
#[derive(Debug, Clone)]
pub struct MergePipeline {
    renderer: Arc<dyn TemplateRenderer>,
    formats: FormatRegistry,
}

impl Default for MergePipeline {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughRenderer::new()))
    }
}

impl MergePipeline {
    /// Pipeline with the given renderer and default formats
    #[must_use]
    pub fn new(renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self {
            renderer,
            formats: FormatRegistry::with_defaults(),
        }
    }

    /// Replace the format registry
    #[must_use]
    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }

    /// Renderer in use
    #[must_use]
    pub fn renderer(&self) -> &dyn TemplateRenderer {
        self.renderer.as_ref()
    }

    /// Run the merge
    ///
    /// # Errors
    /// - [`MergeError::Param`] for a malformed override or unknown file
    /// - [`MergeError::Render`] if the renderer fails
    /// - [`MergeError::Document`] if a file cannot be parsed or edited
    /// - [`MergeError::Constraint`] if a merged file breaks its constraints
    pub fn merge(&self, request: &MergeRequest<'_>) -> Result<MergeOutcome, MergeError> {
        let template = request.template;
        for (file, params) in request.overrides {
            if !template.files.contains_key(file) {
                return Err(ParamError::UnknownFile(file.clone()).into());
            }
            params.validate()?;
        }

        let rendered_text = self.renderer.render(template, request.context)?;

        let mut files = BTreeMap::new();
        let mut dropped = Vec::new();
        for (name, tfile) in &template.files {
            let format = self.formats.resolve(name, tfile.format);
            let base = rendered_text
                .get(name)
                .map_or(tfile.content.as_str(), String::as_str);
            let constraints = template.constraints_for(name);

            let mut params = request.overrides.get(name).cloned().unwrap_or_default();
            if let Some(set) = constraints {
                for key in params.retain_keys(|k| !set.is_immutable(k)) {
                    tracing::warn!(
                        item = %request.context.item,
                        file = %name,
                        key = %key,
                        "dropping override of immutable parameter"
                    );
                    dropped.push(DroppedParam {
                        file: name.clone(),
                        key,
                    });
                }
            }

            let text = params.content.as_deref().unwrap_or(base);
            let doc_err = |source: DocumentError| MergeError::Document {
                file: name.clone(),
                source,
            };
            let mut doc = ConfigDocument::parse(format, text).map_err(doc_err)?;
            for op in params.ops() {
                doc.apply(op).map_err(doc_err)?;
            }
            if let Some(set) = constraints {
                set.validate(&doc).map_err(|source| MergeError::Constraint {
                    file: name.clone(),
                    source,
                })?;
            }

            let content = doc.render().map_err(doc_err)?;
            files.insert(name.clone(), RenderedFile::new(format, content));
        }

        let rendered = RenderedConfig::seal(files, request.context.marker.clone());
        tracing::debug!(
            item = %request.context.item,
            renderer = self.renderer.name(),
            revision = %rendered.revision().short(),
            files = rendered.len(),
            "merged configuration"
        );
        Ok(MergeOutcome { rendered, dropped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ReloadPolicy, TemplateFile};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use reconf_artifact::{ConstraintSet, ItemName, ParamConstraint, ParamType};

    fn mysql_template() -> ConfigTemplate {
        ConfigTemplate::new(ReloadPolicy::Sql)
            .with_file(
                "my.cnf",
                TemplateFile::new("[mysqld]\nmax_connections=50\nport=3306\n"),
            )
            .with_file("init.sh", TemplateFile::new("#!/bin/sh\n"))
            .with_constraints(
                "my.cnf",
                ConstraintSet::new()
                    .with(
                        "mysqld.max_connections",
                        ParamConstraint::of(ParamType::Integer).range(Some(1.0), Some(5000.0)),
                    )
                    .with("mysqld.port", ParamConstraint::of(ParamType::Integer).immutable()),
            )
    }

    fn ctx(marker: Option<&str>) -> RenderContext {
        RenderContext::new(ItemName::new("mysql-config").unwrap(), "mysql")
            .with_marker(marker.map(str::to_string))
    }

    fn merge(
        overrides: &BTreeMap<String, ConfigParams>,
        marker: Option<&str>,
    ) -> Result<MergeOutcome, MergeError> {
        let template = mysql_template();
        let context = ctx(marker);
        MergePipeline::default().merge(&MergeRequest {
            template: &template,
            overrides,
            context: &context,
        })
    }

    fn one(file: &str, params: ConfigParams) -> BTreeMap<String, ConfigParams> {
        BTreeMap::from([(file.to_string(), params)])
    }

    #[test]
    fn parameter_override_replaces_default() {
        let out = merge(
            &one("my.cnf", ConfigParams::new().set("mysqld.max_connections", "100")),
            None,
        )
        .unwrap();
        assert_eq!(
            out.rendered.content("my.cnf"),
            Some("[mysqld]\nmax_connections=100\nport=3306\n")
        );
        assert_eq!(out.rendered.content("init.sh"), Some("#!/bin/sh\n"));
    }

    #[test]
    fn removing_missing_key_is_noop() {
        let base = merge(&BTreeMap::new(), None).unwrap();
        let out = merge(&one("my.cnf", ConfigParams::new().unset("mysqld.nope")), None).unwrap();
        assert_eq!(out.rendered.revision(), base.rendered.revision());
    }

    #[test]
    fn content_then_parameters() {
        let params = ConfigParams::new()
            .with_content("[mysqld]\nmax_connections=10\n")
            .set("mysqld.max_connections", "20");
        let out = merge(&one("my.cnf", params), None).unwrap();
        assert_eq!(
            out.rendered.content("my.cnf"),
            Some("[mysqld]\nmax_connections=20\n")
        );
    }

    #[test]
    fn immutable_override_is_dropped() {
        let out = merge(&one("my.cnf", ConfigParams::new().set("mysqld.port", "1")), None).unwrap();
        assert_eq!(
            out.dropped,
            vec![DroppedParam {
                file: "my.cnf".into(),
                key: "mysqld.port".into()
            }]
        );
        assert!(out.rendered.content("my.cnf").unwrap().contains("port=3306"));
    }

    #[test]
    fn constraint_violation_is_error() {
        let err = merge(
            &one("my.cnf", ConfigParams::new().set("mysqld.max_connections", "0")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Constraint { .. }));
        assert_eq!(err.file(), Some("my.cnf"));
    }

    #[test]
    fn raw_file_rejects_parameters_but_takes_content() {
        let err = merge(&one("init.sh", ConfigParams::new().set("a", "b")), None).unwrap_err();
        assert!(matches!(err, MergeError::Document { .. }));

        let out = merge(&one("init.sh", ConfigParams::new().with_content("echo hi\n")), None).unwrap();
        assert_eq!(out.rendered.content("init.sh"), Some("echo hi\n"));
    }

    #[test]
    fn unknown_file_is_error() {
        let err = merge(&one("other.cnf", ConfigParams::new().set("a", "b")), None).unwrap_err();
        assert!(matches!(err, MergeError::Param(ParamError::UnknownFile(_))));
    }

    #[test]
    fn marker_changes_revision_only() {
        let a = merge(&BTreeMap::new(), Some("1")).unwrap();
        let b = merge(&BTreeMap::new(), Some("2")).unwrap();
        assert_ne!(a.rendered.revision(), b.rendered.revision());
        assert_eq!(a.rendered.files(), b.rendered.files());
    }

    proptest! {
        #[test]
        fn merge_is_deterministic(
            values in proptest::collection::btree_map("[a-z]{1,8}", proptest::option::of("[a-z0-9]{0,6}"), 0..8),
            marker in proptest::option::of("[a-z0-9]{1,4}"),
        ) {
            let params = ConfigParams { content: None, parameters: values };
            let overrides = one("my.cnf", params);
            let a = merge(&overrides, marker.as_deref()).unwrap();
            let b = merge(&overrides, marker.as_deref()).unwrap();
            prop_assert_eq!(a.rendered.revision(), b.rendered.revision());
            prop_assert!(a.rendered.verify());
        }
    }
}
