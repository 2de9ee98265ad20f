//! Base templates
//!
//! A [`ConfigTemplate`] is what a [`TemplateRef`] resolves to: the default
//! file set, per-file constraints and the reload policy instances use to
//! pick up a new revision. Changes touching static parameters override
//! that policy with [`ReloadPolicy::Restart`].

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use reconf_artifact::{ConstraintSet, FileChange, FileFormat, RenderedConfig};

/// Reference to a template
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TemplateRef(String);

impl TemplateRef {
    /// Create a reference
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Referenced name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TemplateRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TemplateRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// How an instance picks up new configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadPolicy {
    /// Send a signal to the process
    Signal,
    /// Run `SET`-style statements against the instance
    Sql,
    /// Run a shell command
    Shell,
    /// Call an HTTP reload endpoint
    Http,
    /// Run a templated script
    TemplateScript,
    /// Restart the instance with the new files
    Restart,
}

impl ReloadPolicy {
    /// All policies
    pub const ALL: [Self; 6] = [
        Self::Signal,
        Self::Sql,
        Self::Shell,
        Self::Http,
        Self::TemplateScript,
        Self::Restart,
    ];

    /// Kebab-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Sql => "sql",
            Self::Shell => "shell",
            Self::Http => "http",
            Self::TemplateScript => "template-script",
            Self::Restart => "restart",
        }
    }
}

impl Display for ReloadPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file of a template
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TemplateFile {
    /// Explicit format; guessed from the file name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
    /// Default content
    #[serde(default)]
    pub content: String,
}

impl TemplateFile {
    /// File with format guessed from its name
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            format: None,
            content: content.into(),
        }
    }

    /// File with explicit format
    #[must_use]
    pub fn with_format(mut self, format: FileFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// Resolved template
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConfigTemplate {
    /// Default files, by name
    #[serde(default)]
    pub files: BTreeMap<String, TemplateFile>,
    /// Constraints, by file name
    #[serde(default)]
    pub constraints: BTreeMap<String, ConstraintSet>,
    /// Reload policy for dynamic changes
    pub reload_policy: ReloadPolicy,
}

impl ConfigTemplate {
    /// Empty template with a reload policy
    #[must_use]
    pub fn new(reload_policy: ReloadPolicy) -> Self {
        Self {
            files: BTreeMap::new(),
            constraints: BTreeMap::new(),
            reload_policy,
        }
    }

    /// Add a file
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, file: TemplateFile) -> Self {
        self.files.insert(name.into(), file);
        self
    }

    /// Add constraints for a file
    #[must_use]
    pub fn with_constraints(mut self, file: impl Into<String>, set: ConstraintSet) -> Self {
        self.constraints.insert(file.into(), set);
        self
    }

    /// Constraints of one file, if any
    #[must_use]
    pub fn constraints_for(&self, file: &str) -> Option<&ConstraintSet> {
        self.constraints.get(file)
    }

    /// Policy that moves instances from `previous` to `next`
    ///
    /// [`ReloadPolicy::Restart`] when a static parameter changed or a file
    /// changed as a whole, the template's policy otherwise. Without a
    /// previous set every change is dynamic.
    #[must_use]
    pub fn resolve_reload_policy(
        &self,
        previous: Option<&RenderedConfig>,
        next: &RenderedConfig,
    ) -> ReloadPolicy {
        let Some(previous) = previous else {
            return self.reload_policy;
        };
        let needs_restart = next.diff(previous).iter().any(|change| match change {
            FileChange::Whole { .. } => true,
            FileChange::Keys { file, keys } => self
                .constraints_for(file)
                .is_some_and(|set| keys.iter().any(|k| set.requires_restart(k))),
        });
        if needs_restart {
            ReloadPolicy::Restart
        } else {
            self.reload_policy
        }
    }
}
