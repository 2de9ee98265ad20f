//! Scenario files
//!
//! A scenario describes one component: its templates, its instances, the
//! items to create and a list of steps applied afterwards. Scenarios are
//! YAML; items use the same camelCase keys as the engine's API.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use reconf_core::{ConfigTemplate, ConfigurationItem, EngineConfig, ItemName, TemplateRef};

/// A component, its collaborators and what happens to it
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Component the items configure
    pub component: String,
    /// Engine settings; defaults when absent
    #[serde(default)]
    pub config: Option<EngineConfig>,
    /// Instance ids present at start
    #[serde(default)]
    pub instances: Vec<String>,
    /// Templates, by reference
    #[serde(default)]
    pub templates: BTreeMap<String, ConfigTemplate>,
    /// Items created before the first step
    #[serde(default)]
    pub items: Vec<ConfigurationItem>,
    /// Applied in order once the initial items settle
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One scripted change
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Step {
    /// Create or edit an item
    Upsert { item: ConfigurationItem },
    /// Delete an item
    Remove { name: String },
    /// Resume a paused item
    Resume { name: String },
    /// Force a re-render
    Rerender { name: String },
    /// Replace a template and notify the items using it
    UpdateTemplate {
        template: String,
        config: ConfigTemplate,
    },
    /// Replace the instance set
    ScaleTo { instances: Vec<String> },
}

impl Step {
    /// Short label for reports
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Upsert { item } => format!("upsert {}", item.name),
            Self::Remove { name } => format!("remove {name}"),
            Self::Resume { name } => format!("resume {name}"),
            Self::Rerender { name } => format!("rerender {name}"),
            Self::UpdateTemplate { template, .. } => format!("update-template {template}"),
            Self::ScaleTo { instances } => format!("scale-to {}", instances.len()),
        }
    }
}

impl Scenario {
    /// Parse YAML text
    ///
    /// # Errors
    /// Returns error if the text does not parse or names are inconsistent
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let scenario: Self = serde_yaml::from_str(text).context("invalid scenario YAML")?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Read and parse a scenario file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or does not parse
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read scenario {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in scenario {}", path.display()))
    }

    /// Engine settings to run with
    ///
    /// # Errors
    /// Returns error if the embedded config is out of range
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let config = self.config.clone().unwrap_or_default();
        config.validate().context("invalid engine config in scenario")?;
        Ok(config)
    }

    /// Item declared in `items` or, failing that, the last upsert step for it
    #[must_use]
    pub fn item(&self, name: &str) -> Option<&ConfigurationItem> {
        let from_steps = self.steps.iter().rev().find_map(|step| match step {
            Step::Upsert { item } if item.name.as_str() == name => Some(item),
            _ => None,
        });
        from_steps.or_else(|| self.items.iter().find(|i| i.name.as_str() == name))
    }

    /// Template a scenario-local reference points at
    #[must_use]
    pub fn template(&self, template: &TemplateRef) -> Option<&ConfigTemplate> {
        self.templates.get(template.as_str())
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for item in &self.items {
            if !seen.insert(item.name.clone()) {
                bail!("item '{}' declared twice", item.name);
            }
        }
        for step in &self.steps {
            let name = match step {
                Step::Remove { name } | Step::Resume { name } | Step::Rerender { name } => name,
                _ => continue,
            };
            ItemName::new(name.as_str()).with_context(|| format!("step '{}'", step.label()))?;
        }
        Ok(())
    }
}
