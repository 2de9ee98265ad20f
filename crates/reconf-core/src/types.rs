//! Core types for the reconfiguration engine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reconf_artifact::{ConfigParams, ItemName, NameError, Revision, RevisionError};
use reconf_merge::{ReloadPolicy, TemplateRef};

use crate::config::FailurePolicy;
use crate::phase::Phase;

/// One templated configuration file set bound to a component
///
/// `name` and `template_ref` are fixed at creation; every other field may
/// change on upsert.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationItem {
    /// Unique key within the owning resource
    pub name: ItemName,
    /// Default template
    pub template_ref: TemplateRef,
    /// Replaces the default template when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_template_ref: Option<TemplateRef>,
    /// Overrides, by config file name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_parameter_overrides: BTreeMap<String, ConfigParams>,
    /// Opaque version nonce; any change forces a re-render
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_marker: Option<String>,
    /// Overrides the engine's failure policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
}

/// Inputs that determine rendered content
#[derive(serde::Serialize)]
struct RenderInputs<'a> {
    template: &'a TemplateRef,
    overrides: &'a BTreeMap<String, ConfigParams>,
    marker: Option<&'a str>,
}

impl ConfigurationItem {
    /// Create an item with no overrides
    ///
    /// # Errors
    /// Returns [`NameError`] if `name` is not a valid item name
    pub fn new(name: &str, template_ref: impl Into<TemplateRef>) -> Result<Self, NameError> {
        Ok(Self::named(ItemName::new(name)?, template_ref))
    }

    /// Create an item from an already validated name
    #[must_use]
    pub fn named(name: ItemName, template_ref: impl Into<TemplateRef>) -> Self {
        Self {
            name,
            template_ref: template_ref.into(),
            override_template_ref: None,
            file_parameter_overrides: BTreeMap::new(),
            trigger_marker: None,
            failure_policy: None,
        }
    }

    /// Set override template
    #[must_use]
    pub fn with_override_template(mut self, template_ref: impl Into<TemplateRef>) -> Self {
        self.override_template_ref = Some(template_ref.into());
        self
    }

    /// Set overrides for one file
    #[must_use]
    pub fn with_params(mut self, file: impl Into<String>, params: ConfigParams) -> Self {
        self.file_parameter_overrides.insert(file.into(), params);
        self
    }

    /// Set trigger marker
    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.trigger_marker = Some(marker.into());
        self
    }

    /// Set failure policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    /// Template actually used (override > default)
    #[must_use]
    pub fn effective_template(&self) -> &TemplateRef {
        self.override_template_ref
            .as_ref()
            .unwrap_or(&self.template_ref)
    }

    /// Digest of every input that affects rendered content
    ///
    /// Equal fingerprints mean a trigger would render the same revision.
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn fingerprint(&self) -> Result<Revision, RevisionError> {
        Revision::compute_serializable(&RenderInputs {
            template: self.effective_template(),
            overrides: &self.file_parameter_overrides,
            marker: self.trigger_marker.as_deref(),
        })
    }
}

/// Outcome of the most recent rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ExecResult {
    /// No rollout yet
    #[default]
    None,
    /// Rollout running
    InProgress,
    /// All instances applied the revision
    Success,
    /// Some instances failed
    PartialFailure,
    /// Rollout cannot proceed without intervention
    FatalFailure,
    /// Abandoned in favour of a newer trigger
    Superseded,
}

/// Rollout bookkeeping for one item
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileDetail {
    /// Reload policy chosen for the current revision
    pub policy: Option<ReloadPolicy>,
    /// Outcome of the last rollout
    pub exec_result: ExecResult,
    /// Revision being rolled out
    pub current_revision: Option<Revision>,
    /// Instances that applied `current_revision` (-1 = not computed)
    pub succeed_count: i64,
    /// Instance set size at dispatch (-1 = not computed)
    pub expected_count: i64,
    /// Last failure
    pub err_message: Option<String>,
    /// Rollout token that owns the counts
    pub rollout_token: u64,
}

impl Default for ReconcileDetail {
    fn default() -> Self {
        Self {
            policy: None,
            exec_result: ExecResult::None,
            current_revision: None,
            succeed_count: -1,
            expected_count: -1,
            err_message: None,
            rollout_token: 0,
        }
    }
}

impl ReconcileDetail {
    /// Reset counts for a new rollout
    pub fn start_rollout(&mut self, token: u64, revision: Revision) {
        self.rollout_token = token;
        self.current_revision = Some(revision);
        self.exec_result = ExecResult::InProgress;
        self.succeed_count = -1;
        self.expected_count = -1;
        self.err_message = None;
    }
}

/// Engine-owned status of one item
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationItemStatus {
    /// Item name
    pub name: ItemName,
    /// Flat phase
    pub phase: Phase,
    /// Last revision every instance applied
    pub last_done_revision: Option<Revision>,
    /// Revision the item is converging to
    pub update_revision: Option<Revision>,
    /// Human-readable state
    pub message: Option<String>,
    /// Rollout bookkeeping
    pub reconcile_detail: ReconcileDetail,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl ConfigurationItemStatus {
    /// Fresh status in `Creating`
    #[must_use]
    pub fn new(name: ItemName) -> Self {
        Self {
            name,
            phase: Phase::Creating,
            last_done_revision: None,
            update_revision: None,
            message: None,
            reconcile_detail: ReconcileDetail::default(),
            updated_at: Utc::now(),
        }
    }
}

/// Resource-level summary
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Owning component
    pub component: String,
    /// Most severe item phase
    pub phase: Phase,
    /// Number of tracked items
    pub items: usize,
    /// Item carrying the most severe phase
    pub worst_item: Option<ItemName>,
}

impl ResourceStatus {
    /// Empty resource
    #[must_use]
    pub fn empty(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            phase: Phase::Running,
            items: 0,
            worst_item: None,
        }
    }
}

/// One running replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    /// Stable identifier
    pub id: String,
    /// Address used by executors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Instance {
    /// Instance with id only
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
        }
    }

    /// Set address
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}
