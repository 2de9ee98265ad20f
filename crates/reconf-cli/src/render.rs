//! Offline rendering of one scenario item

use std::fmt::Write as _;

use anyhow::{anyhow, Context};
use reconf_core::{ItemName, RenderedConfig, Revision};
use reconf_merge::{MergePipeline, MergeRequest, RenderContext};

use crate::scenario::Scenario;

/// Merged files of one item
#[derive(Debug, Clone, serde::Serialize)]
pub struct RenderReport {
    pub item: ItemName,
    pub template: String,
    pub revision: Revision,
    pub rendered: RenderedConfig,
    /// `file:key` of overrides dropped as immutable
    pub dropped: Vec<String>,
}

impl RenderReport {
    /// Human-readable listing
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "item:     {}", self.item);
        let _ = writeln!(out, "template: {}", self.template);
        let _ = writeln!(out, "revision: {}", self.revision);
        for key in &self.dropped {
            let _ = writeln!(out, "dropped:  {key} (immutable)");
        }
        for (name, file) in self.rendered.files() {
            let _ = writeln!(out, "\n--- {name} ({}) ---", file.format);
            out.push_str(&file.content);
            if !file.content.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Merge `item` the way the engine would, using the scenario's templates
///
/// # Errors
/// Returns error if the item or its template is unknown, or the merge fails
pub fn render_item(scenario: &Scenario, item: &str) -> anyhow::Result<RenderReport> {
    let config = scenario
        .item(item)
        .ok_or_else(|| anyhow!("item '{item}' not found in scenario"))?;
    let template_ref = config.effective_template();
    let template = scenario
        .template(template_ref)
        .ok_or_else(|| anyhow!("template '{template_ref}' not found in scenario"))?;

    let context = RenderContext::new(config.name.clone(), scenario.component.clone())
        .with_marker(config.trigger_marker.clone());
    let outcome = MergePipeline::default()
        .merge(&MergeRequest {
            template,
            overrides: &config.file_parameter_overrides,
            context: &context,
        })
        .with_context(|| format!("cannot render item '{item}'"))?;

    Ok(RenderReport {
        item: config.name.clone(),
        template: template_ref.as_str().to_string(),
        revision: outcome.rendered.revision(),
        dropped: outcome
            .dropped
            .iter()
            .map(|d| format!("{}:{}", d.file, d.key))
            .collect(),
        rendered: outcome.rendered,
    })
}
