//! Parameter constraints declared by a template
//!
//! A [`ConstraintSet`] maps dotted keys of one file to a
//! [`ParamConstraint`]. Validation runs on the merged document and reports
//! every violation at once. Rules also classify parameters as dynamic or
//! static, which decides how a change reaches running instances.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::document::ConfigDocument;

/// Value type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Any text
    #[default]
    String,
    /// Signed 64-bit integer
    Integer,
    /// Floating point
    Float,
    /// `true`/`false`, `on`/`off`, `yes`/`no`, `1`/`0`
    Boolean,
    /// One of [`ParamConstraint::values`]
    Enum,
}

/// How a running instance picks up a new value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamReload {
    /// Applied by the template's reload policy
    #[default]
    Dynamic,
    /// Only read at startup; the instance must restart
    Static,
}

/// Rule for one parameter
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParamConstraint {
    /// Value type
    #[serde(default, rename = "type")]
    pub param_type: ParamType,

    /// Allowed values for [`ParamType::Enum`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,

    /// Inclusive lower bound for numeric types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Inclusive upper bound for numeric types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Key must be present after merge
    #[serde(default)]
    pub required: bool,

    /// Overrides for this key are dropped
    #[serde(default)]
    pub immutable: bool,

    /// Dynamic or static
    #[serde(default)]
    pub reload: ParamReload,
}

impl ParamConstraint {
    /// Constraint of the given type
    #[must_use]
    pub fn of(param_type: ParamType) -> Self {
        Self {
            param_type,
            ..Self::default()
        }
    }

    /// Set inclusive numeric bounds
    #[must_use]
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Allowed values for an enum
    #[must_use]
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_type = ParamType::Enum;
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Mark as required
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark as immutable
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Mark as static: changing it needs a restart
    #[must_use]
    pub fn static_param(mut self) -> Self {
        self.reload = ParamReload::Static;
        self
    }

    fn check(&self, key: &str, value: &str) -> Option<Violation> {
        let mismatch = || Violation::TypeMismatch {
            key: key.to_string(),
            expected: self.param_type,
            value: value.to_string(),
        };
        let number = match self.param_type {
            ParamType::String => None,
            ParamType::Integer => match value.trim().parse::<i64>() {
                #[allow(clippy::cast_precision_loss)]
                Ok(n) => Some(n as f64),
                Err(_) => return Some(mismatch()),
            },
            ParamType::Float => match value.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Some(n),
                _ => return Some(mismatch()),
            },
            ParamType::Boolean => {
                return parse_bool(value).is_none().then(mismatch);
            }
            ParamType::Enum => {
                return (!self.values.iter().any(|v| v == value)).then(|| Violation::NotAllowed {
                    key: key.to_string(),
                    value: value.to_string(),
                    allowed: self.values.clone(),
                });
            }
        };
        let n = number?;
        let below = self.min.is_some_and(|min| n < min);
        let above = self.max.is_some_and(|max| n > max);
        (below || above).then(|| Violation::OutOfRange {
            key: key.to_string(),
            value: value.to_string(),
            min: self.min,
            max: self.max,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Rules for the keys of one file
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ConstraintSet {
    rules: BTreeMap<String, ParamConstraint>,
}

impl ConstraintSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, rule: ParamConstraint) -> Self {
        self.rules.insert(key.into(), rule);
        self
    }

    /// Rule declared under exactly `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamConstraint> {
        self.rules.get(key)
    }

    /// Rule governing `key`, tolerating a section prefix on either side
    ///
    /// `mysqld.port` finds a rule declared as `port`, and `port` finds a
    /// rule declared as `mysqld.port`.
    #[must_use]
    pub fn rule_for(&self, key: &str) -> Option<&ParamConstraint> {
        if let Some(rule) = self.rules.get(key) {
            return Some(rule);
        }
        if let Some(rule) = key.split_once('.').and_then(|(_, local)| self.rules.get(local)) {
            return Some(rule);
        }
        self.rules
            .iter()
            .find(|(k, _)| k.split_once('.').is_some_and(|(_, local)| local == key))
            .map(|(_, rule)| rule)
    }

    /// Whether overrides of `key` must be dropped
    #[must_use]
    pub fn is_immutable(&self, key: &str) -> bool {
        self.rule_for(key).is_some_and(|r| r.immutable)
    }

    /// Whether a change of `key` needs an instance restart
    #[must_use]
    pub fn requires_restart(&self, key: &str) -> bool {
        self.rule_for(key)
            .is_some_and(|r| r.reload == ParamReload::Static)
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when there are no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check a merged document against every rule
    ///
    /// Raw documents have no keys; only `required` rules can fail there.
    ///
    /// # Errors
    /// Returns [`ConstraintError`] listing all violations
    pub fn validate(&self, doc: &ConfigDocument) -> Result<(), ConstraintError> {
        let violations: Vec<Violation> = self
            .rules
            .iter()
            .filter_map(|(key, rule)| match doc.get(key) {
                Some(value) => rule.check(key, &value),
                None if rule.required => Some(Violation::MissingRequired { key: key.clone() }),
                None => None,
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConstraintError { violations })
        }
    }
}

/// One broken rule
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    /// Required key absent
    #[error("'{key}' is required")]
    MissingRequired { key: String },

    /// Value does not parse as the declared type
    #[error("'{key}' = '{value}' is not a valid {expected:?}")]
    TypeMismatch {
        key: String,
        expected: ParamType,
        value: String,
    },

    /// Numeric value outside bounds
    #[error("'{key}' = {value} is outside [{}, {}]", fmt_bound(.min), fmt_bound(.max))]
    OutOfRange {
        key: String,
        value: String,
        min: Option<f64>,
        max: Option<f64>,
    },

    /// Value not in the enum
    #[error("'{key}' = '{value}' is not one of {allowed:?}")]
    NotAllowed {
        key: String,
        value: String,
        allowed: Vec<String>,
    },
}

fn fmt_bound(bound: &Option<f64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| b.to_string())
}

impl Violation {
    /// Key the violation refers to
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::MissingRequired { key }
            | Self::TypeMismatch { key, .. }
            | Self::OutOfRange { key, .. }
            | Self::NotAllowed { key, .. } => key,
        }
    }
}

/// All violations found in one document
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", summarize(.violations))]
pub struct ConstraintError {
    /// Broken rules, in key order
    pub violations: Vec<Violation>,
}

fn summarize(violations: &[Violation]) -> String {
    let mut out = String::new();
    for (i, v) in violations.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{v}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FileFormat;

    fn props(text: &str) -> ConfigDocument {
        ConfigDocument::parse(FileFormat::Properties, text).unwrap()
    }

    fn mysql_rules() -> ConstraintSet {
        ConstraintSet::new()
            .with(
                "max_connections",
                ParamConstraint::of(ParamType::Integer).range(Some(1.0), Some(10_000.0)),
            )
            .with("sql_mode", ParamConstraint::default().one_of(["STRICT", "ANSI"]))
            .with("port", ParamConstraint::of(ParamType::Integer).immutable())
            .with("ssl", ParamConstraint::of(ParamType::Boolean))
    }

    #[test]
    fn valid_document_passes() {
        let doc = props("max_connections=100\nsql_mode=ANSI\nssl=ON\n");
        assert!(mysql_rules().validate(&doc).is_ok());
    }

    #[test]
    fn collects_every_violation() {
        let doc = props("max_connections=0\nsql_mode=LOOSE\nssl=maybe\nport=x\n");
        let err = mysql_rules().validate(&doc).unwrap_err();
        let keys: Vec<_> = err.violations.iter().map(Violation::key).collect();
        assert_eq!(keys, vec!["max_connections", "port", "sql_mode", "ssl"]);
        assert!(matches!(err.violations[0], Violation::OutOfRange { .. }));
        assert!(matches!(err.violations[1], Violation::TypeMismatch { .. }));
        assert!(matches!(err.violations[2], Violation::NotAllowed { .. }));
        assert!(err.to_string().contains("'max_connections' = 0 is outside [1, 10000]"));
    }

    #[test]
    fn required_key_missing() {
        let rules = ConstraintSet::new().with("datadir", ParamConstraint::default().required());
        let err = rules.validate(&props("a=1\n")).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::MissingRequired {
                key: "datadir".into()
            }]
        );
    }

    #[test]
    fn immutable_lookup() {
        let rules = mysql_rules();
        assert!(rules.is_immutable("port"));
        assert!(!rules.is_immutable("max_connections"));
        assert!(!rules.is_immutable("unknown"));
    }

    #[test]
    fn section_prefix_matches_either_way() {
        let rules = mysql_rules().with(
            "mysqld.innodb_buffer_pool_size",
            ParamConstraint::of(ParamType::Integer).static_param(),
        );
        assert!(rules.is_immutable("mysqld.port"));
        assert!(rules.requires_restart("innodb_buffer_pool_size"));
        assert!(rules.requires_restart("mysqld.innodb_buffer_pool_size"));
        assert!(!rules.requires_restart("mysqld.max_connections"));
        assert!(rules.get("port").is_some());
        assert!(rules.get("mysqld.port").is_none());
    }

    #[test]
    fn deserializes_from_yaml() {
        let rules: ConstraintSet = serde_yaml::from_str(
            "max_connections:\n  type: integer\n  min: 1\nport:\n  type: integer\n  immutable: true\n  reload: static\n",
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.is_immutable("port"));
        assert!(rules.requires_restart("port"));
        assert!(!rules.requires_restart("max_connections"));
        assert_eq!(rules.get("max_connections").unwrap().min, Some(1.0));
    }
}
